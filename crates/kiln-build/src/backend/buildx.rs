//! Multi-platform builds through `docker buildx`.

use std::path::Path;

use async_trait::async_trait;

use kiln_common::KilnResult;

use super::{
    BuildBackend, BuildUnit, ImageResult, build_command, build_error, materialize_dockerfile,
    parse_label_options,
};

/// Backend driving `docker buildx build`.
///
/// When the images will be pushed afterwards, every requested platform is
/// covered by a single invocation. When they must stay local, buildx can
/// only `--load` one platform at a time, so the unit is split into one
/// invocation per target; without that split the results would exist only
/// in the buildx cache and no tag would be addressable afterwards.
#[derive(Debug, Clone)]
pub struct BuildxBackend {
    command: String,
}

impl BuildxBackend {
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

    /// Plan the invocations for one build unit: the argument vector of
    /// each `docker` call, in order.
    fn invocation_plan(unit: &BuildUnit, dockerfile: &Path) -> Vec<Vec<String>> {
        if unit.load && unit.targets.len() > 1 {
            unit.targets
                .iter()
                .map(|target| {
                    let single = BuildUnit {
                        targets: vec![target.clone()],
                        ..unit.clone()
                    };
                    Self::command_args(&single, dockerfile)
                })
                .collect()
        } else {
            vec![Self::command_args(unit, dockerfile)]
        }
    }

    /// Assemble the argument vector for one invocation.
    ///
    /// One `--tag` per target lets per-platform hashes land as distinct
    /// references. `--load` only works for single-platform invocations,
    /// so it is added exactly then.
    fn command_args(unit: &BuildUnit, dockerfile: &Path) -> Vec<String> {
        let mut args = vec![
            "buildx".to_string(),
            "build".to_string(),
            unit.context_dir.display().to_string(),
            "--file".to_string(),
            dockerfile.display().to_string(),
        ];

        let platforms: Vec<String> = unit
            .targets
            .iter()
            .map(|t| t.platform.to_string())
            .collect();
        args.push("--platform".to_string());
        args.push(platforms.join(","));

        for target in &unit.targets {
            args.push("--tag".to_string());
            args.push(target.destination.clone());
        }

        args.push("--target".to_string());
        args.push(unit.target_stage.clone());

        for (key, value) in &unit.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }

        args.extend(unit.options.iter().cloned());

        if unit.no_cache {
            args.push("--no-cache".to_string());
        }
        if unit.targets.len() == 1 {
            args.push("--load".to_string());
        }

        args
    }
}

impl Default for BuildxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildBackend for BuildxBackend {
    fn id(&self) -> &'static str {
        "buildx"
    }

    fn supports_multi_platform(&self) -> bool {
        true
    }

    async fn build(&self, unit: &BuildUnit) -> KilnResult<Vec<ImageResult>> {
        let (dockerfile, _scratch) = materialize_dockerfile(unit)?;

        tracing::info!(
            context = %unit.context_dir.display(),
            platforms = unit.targets.len(),
            load = unit.load,
            "Running buildx build"
        );
        for args in Self::invocation_plan(unit, &dockerfile) {
            let output = build_command(&self.command).args(&args).output().await?;
            if !output.status.success() {
                return Err(build_error(&unit.targets, &output.stderr));
            }
        }

        let labels = parse_label_options(&unit.options);
        Ok(unit
            .targets
            .iter()
            .map(|target| ImageResult {
                reference: target.destination.clone(),
                platform: target.platform.clone(),
                labels: labels.clone(),
                digest: String::new(),
            })
            .collect())
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
    use std::path::PathBuf;

    fn unit(platforms: &[&str], options: &[&str], load: bool) -> BuildUnit {
        let dockerfile = ensure_final_stage_name("FROM alpine\n", "dev").unwrap();
        let targets = platforms
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let platform = Platform::parse(p).unwrap();
                BuildTarget {
                    platform: platform.clone(),
                    hash: PrebuildHash {
                        hash: format!("hash{i}"),
                        platform,
                        context_dir: PathBuf::from("/src"),
                    },
                    destination: format!("test-repo:hash{i}"),
                }
            })
            .collect();

        BuildUnit {
            dockerfile,
            dockerfile_path: PathBuf::from("/src/Dockerfile"),
            context_dir: PathBuf::from("/src"),
            build_args: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            options: options.iter().map(|o| (*o).to_string()).collect(),
            target_stage: "dev".to_string(),
            no_cache: true,
            load,
            targets,
        }
    }

    #[test]
    fn pushable_multi_platform_build_is_one_invocation() {
        let unit = unit(&["linux/amd64", "linux/arm64"], &["--label=test=VALUE"], false);
        let plan = BuildxBackend::invocation_plan(&unit, Path::new("/src/Dockerfile"));

        assert_eq!(plan.len(), 1);
        let args = &plan[0];
        let platform_index = args.iter().position(|a| a == "--platform").unwrap();
        assert_eq!(args[platform_index + 1], "linux/amd64,linux/arm64");
        assert_eq!(args.iter().filter(|a| *a == "--tag").count(), 2);
        assert!(args.contains(&"test-repo:hash0".to_string()));
        assert!(args.contains(&"test-repo:hash1".to_string()));
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(args.contains(&"--label=test=VALUE".to_string()));
        assert!(args.contains(&"FOO=bar".to_string()));
        assert!(!args.contains(&"--load".to_string()));
    }

    #[test]
    fn local_multi_platform_build_loads_each_platform() {
        let unit = unit(&["linux/amd64", "linux/arm64"], &[], true);
        let plan = BuildxBackend::invocation_plan(&unit, Path::new("/src/Dockerfile"));

        assert_eq!(plan.len(), 2);
        for (args, target) in plan.iter().zip(&unit.targets) {
            assert!(args.contains(&"--load".to_string()));
            assert!(args.contains(&target.destination));
            let platform_index = args.iter().position(|a| a == "--platform").unwrap();
            assert_eq!(args[platform_index + 1], target.platform.to_string());
            // Each invocation tags exactly its own destination.
            assert_eq!(args.iter().filter(|a| *a == "--tag").count(), 1);
        }
    }

    #[test]
    fn single_platform_build_is_loaded() {
        let unit = unit(&["linux/amd64"], &[], true);
        let plan = BuildxBackend::invocation_plan(&unit, Path::new("/src/Dockerfile"));
        assert_eq!(plan.len(), 1);
        assert!(plan[0].contains(&"--load".to_string()));
    }
}
