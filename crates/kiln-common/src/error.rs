//! Common error types for the Kiln build pipeline.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors surfaced by the Kiln build pipeline.
///
/// The taxonomy is deliberate: parse, resolution and hash-input failures are
/// fatal and never recovered internally; a build failure for any platform
/// aborts the whole orchestration; a push failure leaves the local image
/// valid so the operation can simply be re-run.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Malformed Dockerfile or devcontainer specification.
    #[error("Parse error: {message}")]
    #[diagnostic(code(kiln::parse))]
    Parse {
        /// What failed to parse.
        message: String,
    },

    /// The specification references a build target that cannot be located.
    #[error("Resolution error: {message}")]
    #[diagnostic(
        code(kiln::resolution),
        help("Check that the devcontainer specification references an existing, buildable target")
    )]
    Resolution {
        /// What could not be resolved.
        message: String,
    },

    /// The build context or Dockerfile could not be read for hashing.
    #[error("Unreadable hash input {path}: {message}")]
    #[diagnostic(code(kiln::hash_input))]
    HashInput {
        /// The unreadable path.
        path: String,
        /// The underlying failure.
        message: String,
    },

    /// A backend build failed for one platform.
    #[error("Build failed for {platform}: {message}")]
    #[diagnostic(code(kiln::build))]
    Build {
        /// The platform whose build failed.
        platform: String,
        /// The backend failure.
        message: String,
    },

    /// Pushing an image reference failed.
    #[error("Push failed for {reference}: {message}")]
    #[diagnostic(
        code(kiln::push),
        help("The image remains valid locally; re-running the build retries the push")
    )]
    Push {
        /// The reference that failed to push.
        reference: String,
        /// The underlying failure.
        message: String,
    },

    /// Invalid target platform string.
    #[error("Invalid platform: {value}")]
    #[diagnostic(code(kiln::platform), help("Use os/arch form, e.g. linux/amd64"))]
    InvalidPlatform {
        /// The rejected value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kiln::internal),
        help("This is a bug, please report it with the full log output")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}
