//! Build orchestration.
//!
//! The orchestrator walks one request through a linear phase sequence:
//! resolve the specification, hash every platform, build, reconcile tags,
//! then push or stop local. Per-platform builds run on a bounded worker
//! pool and the first failure aborts the remaining work.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use kiln_common::{KilnError, KilnResult, Platform};
use kiln_config::{BuildMode, DockerfileTarget, ResolvedConfig};
use kiln_image::{ImageReference, RegistryClient, reference::sanitize_name};

use crate::backend::{BuildBackend, BuildTarget, BuildUnit, ImageResult};
use crate::dockerfile::{DEFAULT_FINAL_STAGE, NormalizedDockerfile, ensure_final_stage_name};
use crate::hash::{PrebuildHash, prebuild_hash};

/// Default number of concurrent per-platform builds.
const DEFAULT_CONCURRENCY: usize = 4;

/// The phases a build request moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Request accepted, nothing started.
    Pending,
    /// Locating and classifying the specification.
    Resolving,
    /// Computing per-platform prebuild hashes.
    Hashing,
    /// Running backend builds.
    Building,
    /// Reconciling built images with the registry view.
    Tagging,
    /// Pushing references to the repository.
    Pushing,
    /// Finished without pushing.
    LocalOnly,
    /// All work complete.
    Done,
    /// Aborted by an error.
    Failed,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Pending => "pending",
            BuildPhase::Resolving => "resolving",
            BuildPhase::Hashing => "hashing",
            BuildPhase::Building => "building",
            BuildPhase::Tagging => "tagging",
            BuildPhase::Pushing => "pushing",
            BuildPhase::LocalOnly => "local-only",
            BuildPhase::Done => "done",
            BuildPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One build request, as handed in by the caller.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Workspace directory or direct specification path.
    pub workspace: PathBuf,
    /// Target platforms. Defaults to the host platform when empty.
    pub platforms: Vec<Platform>,
    /// Destination repository. Without one the build stays local under a
    /// deterministic name.
    pub repository: Option<String>,
    /// Rebuild even when the hash already exists at the destination.
    pub force_build: bool,
    /// Never push, even when a repository is set.
    pub skip_push: bool,
}

/// The completed result of one request.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Final phase, [`BuildPhase::Done`] unless nothing was buildable.
    pub phase: BuildPhase,
    /// One image per requested platform, in request order.
    pub images: Vec<ImageResult>,
}

/// Drives build requests through the phase sequence.
pub struct Orchestrator {
    backend: Arc<dyn BuildBackend>,
    registry: Arc<dyn RegistryClient>,
    concurrency: usize,
}

impl Orchestrator {
    /// Create an orchestrator over a backend and registry pair.
    pub fn new(backend: Arc<dyn BuildBackend>, registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            backend,
            registry,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Override the per-platform build concurrency.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run one request to completion.
    pub async fn run(&self, request: &BuildRequest) -> KilnResult<BuildOutcome> {
        match self.run_phases(request).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::error!(phase = %BuildPhase::Failed, %error, "Build failed");
                Err(error)
            }
        }
    }

    async fn run_phases(&self, request: &BuildRequest) -> KilnResult<BuildOutcome> {
        let mut phase = BuildPhase::Pending;

        phase = advance(phase, BuildPhase::Resolving);
        let resolved = kiln_config::resolve(&request.workspace)?;

        let Some(target) = resolved.mode.dockerfile_target().cloned() else {
            let BuildMode::Image { reference } = &resolved.mode else {
                return Err(KilnError::Internal {
                    message: "unbuildable mode without an image reference".to_string(),
                });
            };
            tracing::info!(reference, "Specification names a prebuilt image, nothing to build");
            return Ok(BuildOutcome {
                phase: BuildPhase::Done,
                images: Vec::new(),
            });
        };

        let platforms = effective_platforms(request);
        let raw = std::fs::read_to_string(&target.dockerfile_path).map_err(|e| {
            KilnError::HashInput {
                path: target.dockerfile_path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        let dockerfile = ensure_final_stage_name(&raw, DEFAULT_FINAL_STAGE)?;

        phase = advance(phase, BuildPhase::Hashing);
        let hashes = self
            .hash_platforms(&resolved, &target, &dockerfile, &platforms)
            .await?;

        let mut targets = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let destination = destination_reference(request, &target.context_dir, &hash.hash)?;
            targets.push(BuildTarget {
                platform: hash.platform.clone(),
                hash,
                destination,
            });
        }

        phase = advance(phase, BuildPhase::Building);
        let mut images = self.build_targets(request, &resolved, &target, &dockerfile, targets).await?;

        phase = advance(phase, BuildPhase::Tagging);
        self.reconcile(&mut images).await;

        if request.skip_push {
            advance(phase, BuildPhase::LocalOnly);
        } else if request.repository.is_some() {
            phase = advance(phase, BuildPhase::Pushing);
            for image in &images {
                self.registry.push(&image.reference).await?;
            }
            advance(phase, BuildPhase::Done);
        } else {
            advance(phase, BuildPhase::LocalOnly);
        }

        Ok(BuildOutcome {
            phase: BuildPhase::Done,
            images,
        })
    }

    /// Hash every platform on the blocking pool; hashing walks the whole
    /// build context.
    async fn hash_platforms(
        &self,
        resolved: &ResolvedConfig,
        target: &DockerfileTarget,
        dockerfile: &NormalizedDockerfile,
        platforms: &[Platform],
    ) -> KilnResult<Vec<PrebuildHash>> {
        let mut tasks = JoinSet::new();
        for (index, platform) in platforms.iter().cloned().enumerate() {
            let spec = resolved.spec.clone();
            let target = target.clone();
            let dockerfile = dockerfile.clone();
            tasks.spawn_blocking(move || {
                prebuild_hash(&spec, &target, &platform, &dockerfile).map(|hash| (index, hash))
            });
        }

        let mut slots: Vec<Option<PrebuildHash>> = vec![None; platforms.len()];
        while let Some(joined) = tasks.join_next().await {
            let (index, hash) = joined.map_err(|e| KilnError::Internal {
                message: format!("hashing task panicked: {e}"),
            })??;
            slots[index] = Some(hash);
        }

        slots
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| KilnError::Internal {
                    message: "hashing produced no result for a platform".to_string(),
                })
            })
            .collect()
    }

    /// Build all targets, reusing existing destination images unless the
    /// request forces a rebuild.
    async fn build_targets(
        &self,
        request: &BuildRequest,
        resolved: &ResolvedConfig,
        target: &DockerfileTarget,
        dockerfile: &NormalizedDockerfile,
        targets: Vec<BuildTarget>,
    ) -> KilnResult<Vec<ImageResult>> {
        let order: Vec<String> = targets.iter().map(|t| t.destination.clone()).collect();
        let mut pending = Vec::new();
        let mut reused = Vec::new();

        for build_target in targets {
            if !request.force_build {
                if let Ok(details) = self.registry.inspect(&build_target.destination).await {
                    tracing::info!(
                        reference = %build_target.destination,
                        "Prebuild hash already present, reusing image"
                    );
                    reused.push(ImageResult {
                        reference: build_target.destination,
                        platform: build_target.platform,
                        labels: details.labels,
                        digest: details.digest,
                    });
                    continue;
                }
            }
            pending.push(build_target);
        }

        if pending.is_empty() {
            return Ok(reused);
        }

        let unit = |targets: Vec<BuildTarget>| BuildUnit {
            dockerfile: dockerfile.clone(),
            dockerfile_path: target.dockerfile_path.clone(),
            context_dir: target.context_dir.clone(),
            build_args: target.args.clone(),
            options: target.options.clone(),
            target_stage: target
                .target
                .clone()
                .unwrap_or_else(|| dockerfile.final_stage.clone()),
            no_cache: request.force_build,
            load: request.skip_push || request.repository.is_none(),
            targets,
        };

        let mut built = if self.backend.supports_multi_platform() {
            tracing::info!(
                backend = self.backend.id(),
                platforms = pending.len(),
                "Building all platforms in one invocation"
            );
            self.backend.build(&unit(pending)).await?
        } else {
            self.fan_out(pending, &unit).await?
        };

        // Keep results in request order; compose service detail is logged
        // once so the origin of the build stanza is visible.
        if let BuildMode::Compose { service, .. } = &resolved.mode {
            tracing::debug!(service, "Built from compose service stanza");
        }
        built.extend(reused);
        built.sort_by_key(|image| {
            order
                .iter()
                .position(|d| *d == image.reference)
                .unwrap_or(usize::MAX)
        });
        Ok(built)
    }

    /// One backend invocation per target over a bounded pool; the first
    /// failure aborts everything still queued or running.
    async fn fan_out(
        &self,
        pending: Vec<BuildTarget>,
        unit: &impl Fn(Vec<BuildTarget>) -> BuildUnit,
    ) -> KilnResult<Vec<ImageResult>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for build_target in pending {
            let backend = Arc::clone(&self.backend);
            let semaphore = Arc::clone(&semaphore);
            let one = unit(vec![build_target]);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    KilnError::Internal {
                        message: format!("worker pool closed: {e}"),
                    }
                })?;
                backend.build(&one).await
            });
        }

        let mut images = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| KilnError::Internal {
                message: format!("build task panicked: {e}"),
            })?;
            match result {
                Ok(mut built) => images.append(&mut built),
                Err(error) => {
                    tasks.abort_all();
                    return Err(error);
                }
            }
        }
        Ok(images)
    }

    /// Enrich built images with the registry's view of them. Inspection is
    /// best-effort; a backend that cannot be inspected keeps its own data.
    async fn reconcile(&self, images: &mut [ImageResult]) {
        for image in images {
            match self.registry.inspect(&image.reference).await {
                Ok(details) => {
                    if image.digest.is_empty() {
                        image.digest = details.digest;
                    }
                    if image.labels.is_empty() {
                        image.labels = details.labels;
                    }
                }
                Err(error) => {
                    tracing::warn!(reference = %image.reference, %error, "Image inspection failed");
                }
            }
        }
    }
}

fn advance(from: BuildPhase, to: BuildPhase) -> BuildPhase {
    tracing::info!(from = %from, to = %to, "Build phase transition");
    to
}

fn effective_platforms(request: &BuildRequest) -> Vec<Platform> {
    if request.platforms.is_empty() {
        vec![Platform::host()]
    } else {
        request.platforms.clone()
    }
}

/// The destination reference for one hash: `repository:hash`, or a
/// deterministic local name derived from the context when no repository
/// was given.
fn destination_reference(
    request: &BuildRequest,
    context_dir: &Path,
    hash: &str,
) -> KilnResult<String> {
    let Some(repository) = &request.repository else {
        return Ok(format!("{}:{hash}", local_image_name(context_dir)));
    };

    let parsed = ImageReference::parse(repository)?.with_tag(hash);
    // A bare repository stays bare; the default registry is implied, not
    // written into the tag.
    if repository.contains(&parsed.registry) {
        Ok(parsed.full_reference())
    } else {
        Ok(parsed.short())
    }
}

/// Deterministic local image name for a build context: a sanitized
/// directory stem plus a short path digest, stable across invocations on
/// the same machine.
fn local_image_name(context_dir: &Path) -> String {
    let canonical = context_dir
        .canonicalize()
        .unwrap_or_else(|_| context_dir.to_path_buf());
    let stem = canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());

    let digest = hex::encode(Sha256::digest(canonical.display().to_string().as_bytes()));
    format!("kiln-{}-{}", sanitize_name(&stem), &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_image_name_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = local_image_name(dir.path());
        let b = local_image_name(dir.path());
        assert_eq!(a, b);
        assert!(a.starts_with("kiln-"));
    }

    #[test]
    fn local_image_name_differs_per_context() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_ne!(local_image_name(a.path()), local_image_name(b.path()));
    }

    #[test]
    fn destination_uses_repository_when_set() {
        let request = BuildRequest {
            workspace: PathBuf::from("."),
            platforms: Vec::new(),
            repository: Some("test-repo".to_string()),
            force_build: true,
            skip_push: true,
        };
        let reference = destination_reference(&request, Path::new("/src"), "2f3a").unwrap();
        assert_eq!(reference, "test-repo:2f3a");
    }

    #[test]
    fn destination_keeps_an_explicit_registry() {
        let request = BuildRequest {
            workspace: PathBuf::from("."),
            platforms: Vec::new(),
            repository: Some("ghcr.io/org/app".to_string()),
            force_build: true,
            skip_push: true,
        };
        let reference = destination_reference(&request, Path::new("/src"), "2f3a").unwrap();
        assert_eq!(reference, "ghcr.io/org/app:2f3a");
    }

    #[test]
    fn phases_render_lowercase() {
        assert_eq!(BuildPhase::LocalOnly.to_string(), "local-only");
        assert_eq!(BuildPhase::Building.to_string(), "building");
    }
}
