//! Single-platform builds through the daemon's internal build engine.

use async_trait::async_trait;

use kiln_common::{KilnError, KilnResult};

use super::{
    BuildBackend, BuildUnit, ImageResult, build_command, build_error, materialize_dockerfile,
    parse_label_options,
};

/// Backend driving plain `docker build` with BuildKit enabled, one
/// platform per invocation. The orchestrator fans out across platforms.
#[derive(Debug, Clone)]
pub struct BuildkitBackend {
    command: String,
}

impl BuildkitBackend {
    /// Create a backend using the `docker` binary from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_command("docker")
    }

    /// Create a backend using a specific CLI binary.
    #[must_use]
    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    fn command_args(unit: &BuildUnit, dockerfile: &std::path::Path) -> Vec<String> {
        let target = &unit.targets[0];
        let mut args = vec![
            "build".to_string(),
            unit.context_dir.display().to_string(),
            "--file".to_string(),
            dockerfile.display().to_string(),
            "--platform".to_string(),
            target.platform.to_string(),
            "--tag".to_string(),
            target.destination.clone(),
            "--target".to_string(),
            unit.target_stage.clone(),
        ];

        for (key, value) in &unit.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }

        args.extend(unit.options.iter().cloned());

        if unit.no_cache {
            args.push("--no-cache".to_string());
        }

        args
    }
}

impl Default for BuildkitBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildBackend for BuildkitBackend {
    fn id(&self) -> &'static str {
        "buildkit"
    }

    fn supports_multi_platform(&self) -> bool {
        false
    }

    async fn build(&self, unit: &BuildUnit) -> KilnResult<Vec<ImageResult>> {
        if unit.targets.len() != 1 {
            return Err(KilnError::Internal {
                message: format!(
                    "internal build engine takes one platform per invocation, got {}",
                    unit.targets.len()
                ),
            });
        }
        let target = &unit.targets[0];

        let (dockerfile, _scratch) = materialize_dockerfile(unit)?;
        let args = Self::command_args(unit, &dockerfile);

        tracing::info!(platform = %target.platform, reference = %target.destination, "Running internal build");
        let output = build_command(&self.command)
            .env("DOCKER_BUILDKIT", "1")
            .args(&args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(build_error(&unit.targets, &output.stderr));
        }

        Ok(vec![ImageResult {
            reference: target.destination.clone(),
            platform: target.platform.clone(),
            labels: parse_label_options(&unit.options),
            digest: String::new(),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BuildTarget;
    use crate::dockerfile::ensure_final_stage_name;
    use crate::hash::PrebuildHash;
    use kiln_common::Platform;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    #[test]
    fn args_cover_exactly_one_platform() {
        let platform = Platform::parse("linux/arm64").unwrap();
        let unit = BuildUnit {
            dockerfile: ensure_final_stage_name("FROM alpine\n", "dev").unwrap(),
            dockerfile_path: PathBuf::from("/src/Dockerfile"),
            context_dir: PathBuf::from("/src"),
            build_args: BTreeMap::new(),
            options: Vec::new(),
            target_stage: "dev".to_string(),
            no_cache: false,
            load: true,
            targets: vec![BuildTarget {
                platform: platform.clone(),
                hash: PrebuildHash {
                    hash: "abc".to_string(),
                    platform,
                    context_dir: PathBuf::from("/src"),
                },
                destination: "test-repo:abc".to_string(),
            }],
        };

        let args = BuildkitBackend::command_args(&unit, Path::new("/src/Dockerfile"));
        assert_eq!(args[0], "build");
        assert!(args.contains(&"linux/arm64".to_string()));
        assert!(args.contains(&"test-repo:abc".to_string()));
        assert!(!args.contains(&"--no-cache".to_string()));
    }
}
