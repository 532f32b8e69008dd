//! Image reference parsing.

use std::str::FromStr;

use kiln_common::{KilnError, KilnResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest" or a prebuild hash).
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `test-repo` -> docker.io/test-repo:latest
    /// - `test-repo:2f3a...` -> docker.io/test-repo:2f3a...
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::Config {
                message: "empty image reference".to_string(),
            });
        }

        let (name, tag) = if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            (name, ImageTag::Digest(digest[1..].to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon followed by a slash belongs to a registry port.
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                let (name, tag) = reference.split_at(idx);
                (name, ImageTag::Tag(tag[1..].to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        let (registry, repository) = match name.find('/') {
            Some(first_slash) => {
                let head = &name[..first_slash];
                // A registry host has a dot, a port, or is localhost.
                if head.contains('.') || head.contains(':') || head == "localhost" {
                    (head.to_string(), name[first_slash + 1..].to_string())
                } else {
                    (Self::DEFAULT_REGISTRY.to_string(), name.to_string())
                }
            }
            None => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Replace the tag, keeping registry and repository.
    #[must_use]
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.reference = ImageTag::Tag(tag.to_string());
        self
    }

    /// The short `repository:tag` form, without the registry prefix.
    #[must_use]
    pub fn short(&self) -> String {
        match &self.reference {
            ImageTag::Tag(t) => format!("{}:{}", self.repository, t),
            ImageTag::Digest(d) => format!("{}@{}", self.repository, d),
        }
    }

    /// The full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        format!("{}/{}", self.registry, self.short())
    }
}

impl FromStr for ImageReference {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Sanitize a string for use as a local repository name component.
///
/// Lowercases and collapses anything outside `[a-z0-9._-]` to `-`.
#[must_use]
pub fn sanitize_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
