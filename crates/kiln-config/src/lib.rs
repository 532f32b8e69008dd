//! # kiln-config
//!
//! Devcontainer specification loading and resolution.
//!
//! A devcontainer specification describes one of three build modes:
//! Dockerfile-based (direct build), image-based (pull only) or
//! compose-based (build delegated to one referenced service). This crate
//! parses the specification into a canonical in-memory form and classifies
//! it into exactly one of those modes.

#![warn(missing_docs)]

pub mod jsonc;
pub mod resolver;
pub mod spec;

pub use resolver::{BuildMode, DockerfileTarget, ResolvedConfig, resolve};
pub use spec::{BuildSection, ComposeFiles, DevcontainerSpec};
