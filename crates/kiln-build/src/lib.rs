//! # kiln-build
//!
//! Deterministic devcontainer image builds.
//!
//! The pipeline resolves a devcontainer specification into a build mode,
//! normalizes the Dockerfile's final stage, computes a content-addressed
//! prebuild hash per platform, builds through a pluggable backend and
//! finally pushes or keeps the images local. The prebuild hash is the
//! cache key and the image tag at once: identical inputs always yield
//! identical references, so builds can be shared through a repository.

#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod dockerfile;
pub mod hash;
pub mod orchestrator;

pub use backend::{BackendKind, BuildBackend, BuildTarget, BuildUnit, ImageResult};
pub use dockerfile::{NormalizedDockerfile, ensure_final_stage_name};
pub use hash::{PrebuildHash, prebuild_hash};
pub use orchestrator::{BuildOutcome, BuildPhase, BuildRequest, Orchestrator};
