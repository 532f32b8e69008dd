//! # kiln-image
//!
//! Image references and the registry boundary for the Kiln build pipeline.
//!
//! The build orchestrator only ever talks to the narrow [`RegistryClient`]
//! contract (tag, push, inspect); the actual daemon or registry protocol
//! lives behind it. Two implementations ship here: one backed by the docker
//! CLI and one backed by a local OCI image layout store for daemonless
//! builds.

#![warn(missing_docs)]

pub mod client;
pub mod inspect;
pub mod reference;

pub use client::{DockerCli, OciStore, RegistryClient};
pub use inspect::ImageDetails;
pub use reference::ImageReference;
