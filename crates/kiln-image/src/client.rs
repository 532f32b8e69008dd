//! Registry client boundary.
//!
//! The orchestrator depends only on the [`RegistryClient`] trait; whether
//! the images live in a docker daemon or in a local OCI layout store is an
//! execution-strategy detail of the selected backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use kiln_common::{KilnError, KilnResult};

use crate::inspect::{ImageDetails, inspect_layout};

/// Narrow registry contract consumed by the build orchestrator.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Apply an additional reference to an existing image.
    async fn tag(&self, image: &str, reference: &str) -> KilnResult<()>;

    /// Push a reference to its registry.
    ///
    /// Skip-push handling happens upstream: when the orchestrator honors a
    /// skip-push request this method is simply never called.
    async fn push(&self, reference: &str) -> KilnResult<()>;

    /// Inspect a reference, returning its labels and digest.
    async fn inspect(&self, reference: &str) -> KilnResult<ImageDetails>;
}

/// Registry client backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    command: String,
}

impl DockerCli {
    /// Create a client using the `docker` binary from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("docker")
    }

    /// Create a client using a specific CLI binary.
    #[must_use]
    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> KilnResult<String> {
        tracing::debug!(command = %self.command, ?args, "Running CLI command");
        let output = Command::new(&self.command).args(args).output().await?;

        if !output.status.success() {
            return Err(KilnError::Internal {
                message: format!(
                    "{} {} failed: {}",
                    self.command,
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for DockerCli {
    async fn tag(&self, image: &str, reference: &str) -> KilnResult<()> {
        self.run(&["tag", image, reference]).await?;
        Ok(())
    }

    async fn push(&self, reference: &str) -> KilnResult<()> {
        tracing::info!(reference, "Pushing image");
        self.run(&["push", reference])
            .await
            .map_err(|e| KilnError::Push {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn inspect(&self, reference: &str) -> KilnResult<ImageDetails> {
        let stdout = self
            .run(&["image", "inspect", reference, "--format", "{{json .}}"])
            .await?;
        let value: serde_json::Value =
            serde_json::from_str(stdout.trim()).map_err(|e| KilnError::Internal {
                message: format!("unparseable inspect output for {reference}: {e}"),
            })?;

        let labels: BTreeMap<String, String> = value["Config"]["Labels"]
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(ImageDetails {
            reference: reference.to_string(),
            digest: value["Id"].as_str().unwrap_or_default().to_string(),
            labels,
            architecture: value["Architecture"].as_str().map(String::from),
            os: value["Os"].as_str().map(String::from),
        })
    }
}

/// Local OCI image layout store, used by daemonless builds.
///
/// Each reference maps to one layout directory under the store root.
#[derive(Debug, Clone)]
pub struct OciStore {
    root: PathBuf,
}

impl OciStore {
    /// Create a store rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default store location under the user data directory.
    #[must_use]
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("kiln")
            .join("images")
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The layout directory for a reference.
    #[must_use]
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        let sanitized: String = reference
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.root.join(sanitized)
    }
}

#[async_trait]
impl RegistryClient for OciStore {
    async fn tag(&self, image: &str, reference: &str) -> KilnResult<()> {
        let source = self.image_dir(image);
        let destination = self.image_dir(reference);
        if source == destination {
            return Ok(());
        }
        if !source.is_dir() {
            return Err(KilnError::Config {
                message: format!("image {image} not found in the local store"),
            });
        }

        copy_dir(&source, &destination)?;
        tracing::debug!(image, reference, "Tagged image in local store");
        Ok(())
    }

    async fn push(&self, reference: &str) -> KilnResult<()> {
        // Registry transport is an external collaborator; the local store
        // only ever serves skip-push builds.
        Err(KilnError::Push {
            reference: reference.to_string(),
            message: "the local OCI store has no registry transport".to_string(),
        })
    }

    async fn inspect(&self, reference: &str) -> KilnResult<ImageDetails> {
        inspect_layout(&self.image_dir(reference), reference)
    }
}

fn copy_dir(source: &Path, destination: &Path) -> KilnResult<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
