//! Polymorphic build backends.
//!
//! Backend choice is an execution-strategy detail, never an output-format
//! variance: every backend must produce an image with identical labels and
//! equivalent content for the same inputs. Selection happens either by
//! explicit override or by probing the execution environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use kiln_common::{KilnError, KilnResult, Platform};

use crate::dockerfile::NormalizedDockerfile;
use crate::hash::PrebuildHash;

pub mod buildkit;
pub mod buildx;
pub mod dockerless;

pub use buildkit::BuildkitBackend;
pub use buildx::BuildxBackend;
pub use dockerless::DocklessBackend;

/// One platform the orchestrator must produce an image for.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// The target platform.
    pub platform: Platform,
    /// The prebuild hash for this platform.
    pub hash: PrebuildHash,
    /// The destination reference, `repository:hash` or a local name.
    pub destination: String,
}

/// Everything a backend needs to build one or more targets.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    /// The normalized Dockerfile.
    pub dockerfile: NormalizedDockerfile,
    /// Where the original Dockerfile lives.
    pub dockerfile_path: PathBuf,
    /// The build context directory. Read-only to every backend.
    pub context_dir: PathBuf,
    /// Build arguments.
    pub build_args: BTreeMap<String, String>,
    /// Raw extra build options, passed through verbatim.
    pub options: Vec<String>,
    /// The stage to build.
    pub target_stage: String,
    /// Bypass backend layer caching. Never affects the destination tag.
    pub no_cache: bool,
    /// Load built images into the local image store. Set when no push
    /// will follow, so every tag stays addressable after the build.
    pub load: bool,
    /// The targets to produce. Multi-platform backends receive all of
    /// them in one invocation; others receive exactly one.
    pub targets: Vec<BuildTarget>,
}

/// Outcome of building one target.
#[derive(Debug, Clone)]
pub struct ImageResult {
    /// The resolved image reference.
    pub reference: String,
    /// The platform this image was built for.
    pub platform: Platform,
    /// User-specified build-time labels.
    pub labels: BTreeMap<String, String>,
    /// Image digest, when the backend knows it.
    pub digest: String,
}

/// Common contract of every build backend.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Short backend identifier for logs.
    fn id(&self) -> &'static str;

    /// Whether one invocation can cover multiple platforms.
    fn supports_multi_platform(&self) -> bool;

    /// Build the unit's targets. Never mutates the Dockerfile or the
    /// build context on disk.
    async fn build(&self, unit: &BuildUnit) -> KilnResult<Vec<ImageResult>>;
}

/// The three backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Multi-platform builder on a local daemon.
    Buildx,
    /// Internal build engine, one platform per invocation.
    Buildkit,
    /// Daemonless builder writing to a local OCI store.
    Dockerless,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Buildx => "buildx",
            BackendKind::Buildkit => "buildkit",
            BackendKind::Dockerless => "dockerless",
        };
        write!(f, "{name}")
    }
}

/// Select a backend kind, honoring an explicit override first and probing
/// the execution environment otherwise.
pub async fn probe(override_kind: Option<BackendKind>) -> BackendKind {
    if let Some(kind) = override_kind {
        tracing::info!(backend = %kind, "Backend forced by override");
        return kind;
    }

    if !daemon_available("docker").await {
        tracing::info!("No container daemon available, using dockerless backend");
        return BackendKind::Dockerless;
    }

    if command_succeeds("docker", &["buildx", "version"]).await {
        BackendKind::Buildx
    } else {
        tracing::debug!("Daemon lacks buildx support, using internal build engine");
        BackendKind::Buildkit
    }
}

async fn daemon_available(docker: &str) -> bool {
    command_succeeds(docker, &["version", "--format", "{{.Server.Os}}"]).await
}

async fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Extract `--label` options into a label map.
///
/// Both `--label=key=value` and `--label key=value` forms are accepted.
#[must_use]
pub fn parse_label_options(options: &[String]) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    let mut iter = options.iter().peekable();

    while let Some(option) = iter.next() {
        let entry = if let Some(rest) = option.strip_prefix("--label=") {
            Some(rest)
        } else if option == "--label" {
            iter.next().map(String::as_str)
        } else {
            None
        };

        if let Some(entry) = entry {
            match entry.split_once('=') {
                Some((key, value)) => labels.insert(key.to_string(), value.to_string()),
                None => labels.insert(entry.to_string(), String::new()),
            };
        }
    }

    labels
}

/// Build subprocess constructor. The kill-on-drop flag ties the child's
/// lifetime to the spawning task: when the orchestrator aborts in-flight
/// builds after a failure, their `docker build` children die with them
/// instead of finishing and tagging an image nobody will track.
pub(crate) fn build_command(program: &str) -> Command {
    let mut command = Command::new(program);
    command.kill_on_drop(true);
    command
}

/// Make the normalized Dockerfile available on disk without mutating the
/// source file: when normalization changed the content, the modified copy
/// goes to a scratch directory whose lifetime is tied to the returned
/// guard.
pub(crate) fn materialize_dockerfile(
    unit: &BuildUnit,
) -> KilnResult<(PathBuf, Option<tempfile::TempDir>)> {
    if unit.dockerfile.content == unit.dockerfile.raw {
        return Ok((unit.dockerfile_path.clone(), None));
    }

    let scratch = tempfile::tempdir()?;
    let path = scratch.path().join("Dockerfile");
    std::fs::write(&path, &unit.dockerfile.content)?;
    Ok((path, Some(scratch)))
}

/// Last lines of command output, for error reporting.
pub(crate) fn output_tail(output: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(output);
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Build failure for one or more platforms.
pub(crate) fn build_error(targets: &[BuildTarget], stderr: &[u8]) -> KilnError {
    let platforms: Vec<String> = targets.iter().map(|t| t.platform.to_string()).collect();
    KilnError::Build {
        platform: platforms.join(","),
        message: output_tail(stderr, 20),
    }
}
