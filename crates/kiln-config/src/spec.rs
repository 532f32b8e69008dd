//! Devcontainer specification schema.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_common::{KilnError, KilnResult};

use crate::jsonc;

/// A parsed devcontainer specification.
///
/// Only the build-relevant surface of the format is modeled; the full
/// devcontainer schema is an external concern. The `origin` field records
/// where the specification was loaded from and is always absolute.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevcontainerSpec {
    /// Display name. Irrelevant for build identity.
    #[serde(default)]
    pub name: Option<String>,

    /// Prebuilt image reference (image-based mode).
    #[serde(default)]
    pub image: Option<String>,

    /// Top-level Dockerfile path (legacy form of the build section).
    #[serde(default, alias = "dockerFile")]
    pub dockerfile: Option<String>,

    /// Top-level build context (legacy form of the build section).
    #[serde(default)]
    pub context: Option<String>,

    /// Build section for Dockerfile-based mode.
    #[serde(default)]
    pub build: Option<BuildSection>,

    /// Compose file reference(s) for compose-based mode.
    #[serde(default)]
    pub docker_compose_file: Option<ComposeFiles>,

    /// The compose service this devcontainer attaches to.
    #[serde(default)]
    pub service: Option<String>,

    /// Absolute path the specification was loaded from.
    #[serde(skip)]
    pub origin: PathBuf,
}

/// One or several compose files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposeFiles {
    /// A single compose file path.
    Single(String),
    /// An ordered list of compose file paths.
    Multiple(Vec<String>),
}

impl ComposeFiles {
    /// The primary compose file path.
    #[must_use]
    pub fn primary(&self) -> Option<&str> {
        match self {
            ComposeFiles::Single(path) => Some(path.as_str()),
            ComposeFiles::Multiple(paths) => paths.first().map(String::as_str),
        }
    }
}

/// The `build` section of a devcontainer specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSection {
    /// Dockerfile path, relative to the specification.
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Build context directory, relative to the specification.
    #[serde(default)]
    pub context: Option<String>,

    /// Build arguments. Sorted so serialization is canonical.
    #[serde(default)]
    pub args: BTreeMap<String, String>,

    /// Raw extra build options passed through to the backend verbatim,
    /// e.g. `--label=team=platform`.
    #[serde(default)]
    pub options: Vec<String>,

    /// Target stage override.
    #[serde(default)]
    pub target: Option<String>,

    /// Images to use as layer cache sources.
    #[serde(default)]
    pub cache_from: Vec<String>,
}

impl DevcontainerSpec {
    /// Parse a specification from JSONC text.
    pub fn from_str(content: &str) -> KilnResult<Self> {
        serde_json::from_str(&jsonc::strip(content)).map_err(|e| KilnError::Parse {
            message: format!("invalid devcontainer specification: {e}"),
        })
    }

    /// Load a specification from a file, recording its absolute origin.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut spec = Self::from_str(&content)?;
        spec.origin = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        Ok(spec)
    }

    /// The directory containing the specification file.
    #[must_use]
    pub fn origin_dir(&self) -> &Path {
        self.origin.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Build-identity fingerprint of this specification.
    ///
    /// Contains every build-relevant field and nothing else: the display
    /// name never participates in build identity, while build args, options
    /// and target always do.
    #[must_use]
    pub fn build_fingerprint(&self) -> serde_json::Value {
        let build = self.build.clone().unwrap_or_default();
        serde_json::json!({
            "image": self.image,
            "dockerfile": build.dockerfile.or_else(|| self.dockerfile.clone()),
            "args": build.args,
            "options": build.options,
            "target": build.target,
            "cacheFrom": build.cache_from,
            "service": self.service,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_build_section() {
        let spec = DevcontainerSpec::from_str(
            r#"{
                // build configuration
                "name": "Build Example",
                "build": {
                    "dockerfile": "Dockerfile",
                    "context": ".",
                    "args": { "VERSION": "1.0" },
                    "options": ["--label=test=VALUE"],
                },
            }"#,
        )
        .unwrap();

        let build = spec.build.unwrap();
        assert_eq!(build.dockerfile.as_deref(), Some("Dockerfile"));
        assert_eq!(build.args.get("VERSION").map(String::as_str), Some("1.0"));
        assert_eq!(build.options, vec!["--label=test=VALUE"]);
    }

    #[test]
    fn parse_legacy_dockerfile_key() {
        let spec = DevcontainerSpec::from_str(r#"{ "dockerFile": "Dockerfile.dev" }"#).unwrap();
        assert_eq!(spec.dockerfile.as_deref(), Some("Dockerfile.dev"));
    }

    #[test]
    fn parse_compose_files() {
        let spec = DevcontainerSpec::from_str(
            r#"{ "dockerComposeFile": ["docker-compose.yml", "override.yml"], "service": "app" }"#,
        )
        .unwrap();
        assert_eq!(
            spec.docker_compose_file.unwrap().primary(),
            Some("docker-compose.yml")
        );
        assert_eq!(spec.service.as_deref(), Some("app"));
    }

    #[test]
    fn fingerprint_ignores_name() {
        let a = DevcontainerSpec::from_str(r#"{ "name": "A", "image": "alpine" }"#).unwrap();
        let b = DevcontainerSpec::from_str(r#"{ "name": "B", "image": "alpine" }"#).unwrap();
        assert_eq!(a.build_fingerprint(), b.build_fingerprint());
    }

    #[test]
    fn fingerprint_tracks_build_args() {
        let a = DevcontainerSpec::from_str(r#"{ "build": { "args": { "X": "1" } } }"#).unwrap();
        let b = DevcontainerSpec::from_str(r#"{ "build": { "args": { "X": "2" } } }"#).unwrap();
        assert_ne!(a.build_fingerprint(), b.build_fingerprint());
    }
}
