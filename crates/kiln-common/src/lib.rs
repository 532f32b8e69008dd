//! # kiln-common
//!
//! Shared types for the Kiln devcontainer build pipeline.
//!
//! This crate provides the pieces every other Kiln crate needs:
//! - The common error taxonomy ([`KilnError`], [`KilnResult`])
//! - Target platform parsing ([`Platform`])

#![warn(missing_docs)]

pub mod error;
pub mod platform;

pub use error::{KilnError, KilnResult};
pub use platform::Platform;
