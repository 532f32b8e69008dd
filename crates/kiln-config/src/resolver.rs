//! Devcontainer specification resolution.
//!
//! Classifies a loaded specification into exactly one build mode and, for
//! compose-based specifications, locates the referenced service's build
//! stanza and re-expresses it as a nested Dockerfile target. Resolution is
//! a pure parse: it never mutates anything on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use kiln_common::{KilnError, KilnResult};

use crate::spec::{ComposeFiles, DevcontainerSpec};

/// Default Dockerfile name when the specification does not name one.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// A fully resolved Dockerfile build target.
#[derive(Debug, Clone)]
pub struct DockerfileTarget {
    /// Absolute path to the Dockerfile.
    pub dockerfile_path: PathBuf,
    /// Absolute build context directory.
    pub context_dir: PathBuf,
    /// Build arguments.
    pub args: BTreeMap<String, String>,
    /// Raw extra build options (labels etc.), passed through verbatim.
    pub options: Vec<String>,
    /// Explicit target stage, when the specification names one.
    pub target: Option<String>,
}

/// The classified build mode of a devcontainer specification.
///
/// Exactly one mode is ever active for a given specification.
#[derive(Debug, Clone)]
pub enum BuildMode {
    /// Direct Dockerfile build.
    Dockerfile(DockerfileTarget),
    /// Prebuilt image; nothing to build, pull only.
    Image {
        /// The image reference to pull.
        reference: String,
    },
    /// Build delegated to one service of a compose file.
    Compose {
        /// The referenced service name.
        service: String,
        /// The service's build stanza as a nested Dockerfile target.
        target: DockerfileTarget,
    },
}

impl BuildMode {
    /// The Dockerfile target this mode builds, if it builds at all.
    #[must_use]
    pub fn dockerfile_target(&self) -> Option<&DockerfileTarget> {
        match self {
            BuildMode::Dockerfile(target) | BuildMode::Compose { target, .. } => Some(target),
            BuildMode::Image { .. } => None,
        }
    }
}

/// A specification together with its classified build mode.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The parsed specification.
    pub spec: DevcontainerSpec,
    /// The classified build mode.
    pub mode: BuildMode,
}

/// Resolve a devcontainer specification from a workspace or file path.
///
/// Directories are probed for `.devcontainer/devcontainer.json` and
/// `.devcontainer.json`, in that order.
pub fn resolve(path: &Path) -> KilnResult<ResolvedConfig> {
    let spec_path = locate_spec(path)?;
    tracing::debug!(path = %spec_path.display(), "Loading devcontainer specification");

    let spec = DevcontainerSpec::from_file(&spec_path)?;
    let mode = classify(&spec)?;

    tracing::debug!(mode = mode_name(&mode), "Classified devcontainer specification");
    Ok(ResolvedConfig { spec, mode })
}

fn mode_name(mode: &BuildMode) -> &'static str {
    match mode {
        BuildMode::Dockerfile(_) => "dockerfile",
        BuildMode::Image { .. } => "image",
        BuildMode::Compose { .. } => "compose",
    }
}

fn locate_spec(path: &Path) -> KilnResult<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    for candidate in [
        path.join(".devcontainer").join("devcontainer.json"),
        path.join(".devcontainer.json"),
    ] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(KilnError::Resolution {
        message: format!(
            "no devcontainer specification found under {}",
            path.display()
        ),
    })
}

/// Classify a specification into exactly one build mode.
pub fn classify(spec: &DevcontainerSpec) -> KilnResult<BuildMode> {
    let has_dockerfile = spec.build.is_some() || spec.dockerfile.is_some();
    let has_image = spec.image.is_some();
    let has_compose = spec.docker_compose_file.is_some();

    let active = usize::from(has_dockerfile) + usize::from(has_image) + usize::from(has_compose);
    if active != 1 {
        return Err(KilnError::Resolution {
            message: format!(
                "expected exactly one of build/dockerfile, image or dockerComposeFile, found {active}"
            ),
        });
    }

    if has_image {
        return Ok(BuildMode::Image {
            reference: spec.image.clone().unwrap_or_default(),
        });
    }

    if has_compose {
        return resolve_compose(spec);
    }

    Ok(BuildMode::Dockerfile(dockerfile_target(spec)))
}

fn dockerfile_target(spec: &DevcontainerSpec) -> DockerfileTarget {
    let build = spec.build.clone().unwrap_or_default();
    let dockerfile = build
        .dockerfile
        .or_else(|| spec.dockerfile.clone())
        .unwrap_or_else(|| DEFAULT_DOCKERFILE.to_string());
    let context = build
        .context
        .or_else(|| spec.context.clone())
        .unwrap_or_else(|| ".".to_string());

    let base = spec.origin_dir();
    DockerfileTarget {
        dockerfile_path: base.join(dockerfile),
        context_dir: base.join(context),
        args: build.args,
        options: build.options,
        target: build.target,
    }
}

// Minimal compose schema: only the build surface of services matters here.

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    #[serde(default)]
    build: Option<ComposeBuild>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ComposeBuild {
    /// Shorthand: `build: ./dir`.
    Context(String),
    /// Long form with context, dockerfile and args.
    Detailed {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
        #[serde(default)]
        args: Option<ComposeArgs>,
        #[serde(default)]
        target: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ComposeArgs {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl ComposeArgs {
    fn into_map(self) -> BTreeMap<String, String> {
        match self {
            ComposeArgs::Map(map) => map,
            ComposeArgs::List(entries) => entries
                .into_iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (entry, String::new()),
                })
                .collect(),
        }
    }
}

fn resolve_compose(spec: &DevcontainerSpec) -> KilnResult<BuildMode> {
    let compose_rel = spec
        .docker_compose_file
        .as_ref()
        .and_then(ComposeFiles::primary)
        .ok_or_else(|| KilnError::Resolution {
            message: "dockerComposeFile is present but empty".to_string(),
        })?;

    let service_name = spec.service.clone().ok_or_else(|| KilnError::Resolution {
        message: "compose-based specification is missing the service field".to_string(),
    })?;

    let compose_path = spec.origin_dir().join(compose_rel);
    let content = std::fs::read_to_string(&compose_path).map_err(|e| KilnError::Resolution {
        message: format!("cannot read compose file {}: {e}", compose_path.display()),
    })?;
    let compose: ComposeFile = serde_yaml::from_str(&content).map_err(|e| KilnError::Parse {
        message: format!("invalid compose file {}: {e}", compose_path.display()),
    })?;

    let service = compose
        .services
        .get(&service_name)
        .ok_or_else(|| KilnError::Resolution {
            message: format!(
                "service {service_name} not found in {}",
                compose_path.display()
            ),
        })?;

    let build = service.build.as_ref().ok_or_else(|| KilnError::Resolution {
        message: format!("service {service_name} has no build stanza"),
    })?;

    // Build paths are relative to the compose file, not the spec.
    let compose_dir = compose_path.parent().unwrap_or_else(|| Path::new("."));
    let target = match build.clone() {
        ComposeBuild::Context(context) => DockerfileTarget {
            dockerfile_path: compose_dir.join(&context).join(DEFAULT_DOCKERFILE),
            context_dir: compose_dir.join(&context),
            args: BTreeMap::new(),
            options: Vec::new(),
            target: None,
        },
        ComposeBuild::Detailed {
            context,
            dockerfile,
            args,
            target,
        } => {
            let context_dir = compose_dir.join(context.as_deref().unwrap_or("."));
            let dockerfile_path =
                context_dir.join(dockerfile.as_deref().unwrap_or(DEFAULT_DOCKERFILE));
            DockerfileTarget {
                dockerfile_path,
                context_dir,
                args: args.map(ComposeArgs::into_map).unwrap_or_default(),
                options: Vec::new(),
                target,
            }
        }
    };

    Ok(BuildMode::Compose {
        service: service_name,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_spec(dir: &Path, content: &str) -> PathBuf {
        let devcontainer = dir.join(".devcontainer");
        fs::create_dir_all(&devcontainer).unwrap();
        let path = devcontainer.join("devcontainer.json");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn resolves_dockerfile_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "build": { "dockerfile": "Dockerfile", "context": "." } }"#,
        );

        let resolved = resolve(dir.path()).unwrap();
        let BuildMode::Dockerfile(target) = &resolved.mode else {
            panic!("expected dockerfile mode");
        };
        assert!(target.dockerfile_path.ends_with(".devcontainer/Dockerfile"));
        assert!(target.context_dir.ends_with(".devcontainer"));
    }

    #[test]
    fn resolves_image_mode() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(dir.path(), r#"{ "image": "alpine:3.19" }"#);

        let resolved = resolve(dir.path()).unwrap();
        assert!(matches!(
            resolved.mode,
            BuildMode::Image { ref reference } if reference == "alpine:3.19"
        ));
    }

    #[test]
    fn rejects_ambiguous_modes() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "image": "alpine", "build": { "dockerfile": "Dockerfile" } }"#,
        );

        let err = resolve(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::Resolution { .. }));
    }

    #[test]
    fn resolves_compose_service_build() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "dockerComposeFile": "../docker-compose.yml", "service": "app" }"#,
        );
        fs::create_dir_all(dir.path().join("app")).unwrap();
        fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  app:\n    build:\n      context: ./app\n      dockerfile: Dockerfile\n      args:\n        VERSION: \"2\"\n  db:\n    image: postgres\n",
        )
        .unwrap();

        let resolved = resolve(dir.path()).unwrap();
        let BuildMode::Compose { service, target } = &resolved.mode else {
            panic!("expected compose mode");
        };
        assert_eq!(service, "app");
        assert!(target.context_dir.ends_with("app"));
        assert_eq!(target.args.get("VERSION").map(String::as_str), Some("2"));
    }

    #[test]
    fn compose_shorthand_build() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "dockerComposeFile": "../compose.yml", "service": "web" }"#,
        );
        fs::write(
            dir.path().join("compose.yml"),
            "services:\n  web:\n    build: ./web\n",
        )
        .unwrap();

        let resolved = resolve(dir.path()).unwrap();
        let Some(target) = resolved.mode.dockerfile_target() else {
            panic!("expected a buildable mode");
        };
        assert!(target.dockerfile_path.ends_with("web/Dockerfile"));
    }

    #[test]
    fn compose_missing_service_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "dockerComposeFile": "../compose.yml", "service": "missing" }"#,
        );
        fs::write(
            dir.path().join("compose.yml"),
            "services:\n  app:\n    image: alpine\n",
        )
        .unwrap();

        let err = resolve(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::Resolution { .. }));
    }

    #[test]
    fn compose_service_without_build_is_resolution_error() {
        let dir = tempfile::tempdir().unwrap();
        write_spec(
            dir.path(),
            r#"{ "dockerComposeFile": "../compose.yml", "service": "app" }"#,
        );
        fs::write(
            dir.path().join("compose.yml"),
            "services:\n  app:\n    image: alpine\n",
        )
        .unwrap();

        let err = resolve(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::Resolution { .. }));
    }
}
