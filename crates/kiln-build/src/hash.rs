//! Prebuild hash calculation.
//!
//! The prebuild hash is the caching key of the whole pipeline: identical
//! relevant inputs must always produce the identical hash, across
//! invocations and across machines, so that a shared repository can reuse
//! images instead of rebuilding them. The hash doubles as the image tag.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use kiln_common::{KilnError, KilnResult, Platform};
use kiln_config::{DevcontainerSpec, DockerfileTarget};

use crate::dockerfile::{NormalizedDockerfile, rename_final_stage};

/// Stage token substituted for the final stage name while hashing, so a
/// cosmetic rename of the final stage never changes build identity.
pub(crate) const CANONICAL_STAGE: &str = "kiln_canonical_stage";

/// Number of hash characters kept for the image tag.
const HASH_LENGTH: usize = 32;

/// Deterministic identifier for one (spec, platform, arch) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuildHash {
    /// The hex hash string, used verbatim as the image tag.
    pub hash: String,
    /// The target platform this hash belongs to.
    pub platform: Platform,
    /// The build context this hash was computed over.
    pub context_dir: PathBuf,
}

/// Compute the prebuild hash for one target platform.
///
/// Incorporated: the build-relevant specification fields (never the
/// display name), the canonicalized Dockerfile content, the resolved build
/// args/options/target, a content manifest of the build context, and the
/// platform's os and arch as independent components. Deliberately
/// excluded: file modification times, absolute host paths, and
/// orchestration flags such as force-build or skip-push.
pub fn prebuild_hash(
    spec: &DevcontainerSpec,
    target: &DockerfileTarget,
    platform: &Platform,
    dockerfile: &NormalizedDockerfile,
) -> KilnResult<PrebuildHash> {
    let canonical_content = rename_final_stage(&dockerfile.content, CANONICAL_STAGE)?;

    let fingerprint = serde_json::to_vec(&serde_json::json!({
        "spec": spec.build_fingerprint(),
        "args": target.args,
        "options": target.options,
        "target": target.target,
    }))?;

    let dockerfile_rel = dockerfile_identity(target);

    let mut hasher = Sha256::new();
    hasher.update(b"spec\0");
    hasher.update(&fingerprint);
    hasher.update(b"dockerfile\0");
    hasher.update(dockerfile_rel.as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical_content.as_bytes());
    hasher.update(b"context\0");
    hasher.update(context_digest(&target.context_dir, &dockerfile_rel)?.as_bytes());
    hasher.update(b"platform\0");
    hasher.update(platform.os.as_bytes());
    hasher.update(b"arch\0");
    hasher.update(platform.arch.as_bytes());

    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(HASH_LENGTH);

    tracing::debug!(%platform, hash, "Computed prebuild hash");
    Ok(PrebuildHash {
        hash,
        platform: platform.clone(),
        context_dir: target.context_dir.clone(),
    })
}

/// The Dockerfile's identity inside the context: its relative path when it
/// lives under the context, otherwise just its file name. Absolute host
/// paths never participate in the hash.
fn dockerfile_identity(target: &DockerfileTarget) -> String {
    target
        .dockerfile_path
        .strip_prefix(&target.context_dir)
        .ok()
        .or_else(|| target.dockerfile_path.file_name().map(Path::new))
        .map(|p| unix_path(p))
        .unwrap_or_default()
}

/// Content digest of the build context: sorted relative paths plus file
/// digests. `.git` directories are excluded as build-irrelevant noise, and
/// the Dockerfile itself is excluded because its content already
/// participates through the canonicalized form.
fn context_digest(context_dir: &Path, dockerfile_rel: &str) -> KilnResult<String> {
    let mut entries: Vec<(String, Option<PathBuf>)> = Vec::new();

    let walk = WalkDir::new(context_dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walk {
        let entry = entry.map_err(|e| KilnError::HashInput {
            path: context_dir.display().to_string(),
            message: e.to_string(),
        })?;

        let relative = match entry.path().strip_prefix(context_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => continue,
            Ok(rel) => unix_path(rel),
            Err(_) => continue,
        };
        if relative == dockerfile_rel {
            continue;
        }

        if entry.file_type().is_file() {
            entries.push((relative, Some(entry.path().to_path_buf())));
        } else {
            entries.push((relative, None));
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (relative, file) in entries {
        hasher.update(relative.as_bytes());
        hasher.update(b"\0");
        if let Some(path) = file {
            let content = std::fs::read(&path).map_err(|e| KilnError::HashInput {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            hasher.update(Sha256::digest(&content));
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

fn unix_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::ensure_final_stage_name;
    use std::collections::BTreeMap;

    fn fixture(dockerfile: &str, args: &[(&str, &str)], options: &[&str]) -> (tempfile::TempDir, DevcontainerSpec, DockerfileTarget, NormalizedDockerfile) {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile_path = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile_path, dockerfile).unwrap();

        let spec = DevcontainerSpec::from_str(r#"{ "name": "Fixture" }"#).unwrap();
        let target = DockerfileTarget {
            dockerfile_path,
            context_dir: dir.path().to_path_buf(),
            args: args
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            options: options.iter().map(|o| (*o).to_string()).collect(),
            target: None,
        };
        let normalized = ensure_final_stage_name(dockerfile, "dev").unwrap();
        (dir, spec, target, normalized)
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let (_dir, spec, target, normalized) = fixture("FROM alpine\n", &[], &[]);
        let platform = Platform::parse("linux/amd64").unwrap();

        let a = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();
        let b = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), HASH_LENGTH);
    }

    #[test]
    fn arch_changes_the_hash() {
        let (_dir, spec, target, normalized) = fixture("FROM alpine\n", &[], &[]);

        let amd64 = prebuild_hash(
            &spec,
            &target,
            &Platform::parse("linux/amd64").unwrap(),
            &normalized,
        )
        .unwrap();
        let arm64 = prebuild_hash(
            &spec,
            &target,
            &Platform::parse("linux/arm64").unwrap(),
            &normalized,
        )
        .unwrap();
        assert_ne!(amd64.hash, arm64.hash);
    }

    #[test]
    fn build_args_change_the_hash() {
        let platform = Platform::parse("linux/amd64").unwrap();
        let (_dir, spec, target, normalized) = fixture("FROM alpine\n", &[("V", "1")], &[]);
        let a = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();

        let mut changed = target.clone();
        changed.args.insert("V".to_string(), "2".to_string());
        let b = prebuild_hash(&spec, &changed, &platform, &normalized).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn build_options_change_the_hash() {
        let platform = Platform::parse("linux/amd64").unwrap();
        let (_dir, spec, target, normalized) = fixture("FROM alpine\n", &[], &[]);
        let a = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();

        let mut changed = target.clone();
        changed.options.push("--label=test=VALUE".to_string());
        let b = prebuild_hash(&spec, &changed, &platform, &normalized).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn final_stage_rename_does_not_change_the_hash() {
        let platform = Platform::parse("linux/amd64").unwrap();

        let (_dir_a, spec_a, target_a, named_base) =
            fixture("FROM alpine AS base\nRUN echo hi\n", &[], &[]);
        let a = prebuild_hash(&spec_a, &target_a, &platform, &named_base).unwrap();

        // Same semantics under a different final-stage name.
        let dir_b = tempfile::tempdir().unwrap();
        let dockerfile_b = dir_b.path().join("Dockerfile");
        std::fs::write(&dockerfile_b, "FROM alpine AS runtime\nRUN echo hi\n").unwrap();
        let normalized_b =
            ensure_final_stage_name("FROM alpine AS runtime\nRUN echo hi\n", "dev").unwrap();
        let target_b = DockerfileTarget {
            dockerfile_path: dockerfile_b,
            context_dir: dir_b.path().to_path_buf(),
            args: BTreeMap::new(),
            options: Vec::new(),
            target: None,
        };
        let b = prebuild_hash(&spec_a, &target_b, &platform, &normalized_b).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn dockerfile_content_changes_the_hash() {
        let platform = Platform::parse("linux/amd64").unwrap();
        let (_dir, spec, target, normalized) = fixture("FROM alpine\n", &[], &[]);
        let a = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();

        let changed = ensure_final_stage_name("FROM alpine\nRUN apk add git\n", "dev").unwrap();
        let b = prebuild_hash(&spec, &target, &platform, &changed).unwrap();
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn context_content_changes_the_hash() {
        let platform = Platform::parse("linux/amd64").unwrap();
        let (dir, spec, target, normalized) = fixture("FROM alpine\n", &[], &[]);
        let a = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();

        std::fs::write(dir.path().join("extra.txt"), "content").unwrap();
        let b = prebuild_hash(&spec, &target, &platform, &normalized).unwrap();
        assert_ne!(a.hash, b.hash);
    }
}
