//! kiln-build CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use kiln_common::Platform;
use kiln_image::{DockerCli, OciStore, RegistryClient};

use crate::backend::{self, BackendKind, BuildBackend, BuildkitBackend, BuildxBackend, DocklessBackend};
use crate::orchestrator::{BuildRequest, Orchestrator};

/// kiln-build - Deterministic devcontainer image builds
#[derive(Parser)]
#[command(name = "kiln-build")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// kiln-build commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build a devcontainer workspace
    Build {
        /// Workspace directory or devcontainer.json path
        #[arg(default_value = ".")]
        workspace: PathBuf,

        /// Target platforms, e.g. linux/amd64,linux/arm64
        #[arg(long)]
        platform: Option<String>,

        /// Destination repository; the prebuild hash becomes the tag
        #[arg(long)]
        repository: Option<String>,

        /// Rebuild even when the hash already exists
        #[arg(long)]
        force_build: bool,

        /// Never push, even with a repository set
        #[arg(long)]
        skip_push: bool,

        /// Use the daemon's internal build engine instead of buildx
        #[arg(long, conflicts_with = "force_dockerless")]
        force_internal_buildkit: bool,

        /// Build without any daemon, into the local OCI store
        #[arg(long)]
        force_dockerless: bool,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build {
                workspace,
                platform,
                repository,
                force_build,
                skip_push,
                force_internal_buildkit,
                force_dockerless,
            } => {
                let platforms = match platform {
                    Some(spec) => Platform::parse_list(&spec)?,
                    None => Vec::new(),
                };

                let override_kind = if force_dockerless {
                    Some(BackendKind::Dockerless)
                } else if force_internal_buildkit {
                    Some(BackendKind::Buildkit)
                } else {
                    None
                };

                let kind = backend::probe(override_kind).await;
                let (build_backend, registry): (Arc<dyn BuildBackend>, Arc<dyn RegistryClient>) =
                    match kind {
                        BackendKind::Buildx => {
                            (Arc::new(BuildxBackend::new()), Arc::new(DockerCli::new()))
                        }
                        BackendKind::Buildkit => {
                            (Arc::new(BuildkitBackend::new()), Arc::new(DockerCli::new()))
                        }
                        BackendKind::Dockerless => {
                            let store = OciStore::new(OciStore::default_root());
                            (
                                Arc::new(DocklessBackend::new(store.clone())),
                                Arc::new(store),
                            )
                        }
                    };

                let orchestrator = Orchestrator::new(build_backend, registry);
                let outcome = orchestrator
                    .run(&BuildRequest {
                        workspace,
                        platforms,
                        repository,
                        force_build,
                        skip_push,
                    })
                    .await?;

                if outcome.images.is_empty() {
                    println!("Nothing to build");
                } else {
                    for image in &outcome.images {
                        println!("{}\t{}", image.platform, image.reference);
                    }
                }
                Ok(())
            }
        }
    }
}
