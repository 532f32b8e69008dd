//! Local OCI image layout inspection.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_common::{KilnError, KilnResult};

/// Inspection result for one image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDetails {
    /// The inspected reference.
    pub reference: String,
    /// Manifest digest.
    pub digest: String,
    /// Image config labels.
    pub labels: BTreeMap<String, String>,
    /// Architecture, when recorded in the config.
    pub architecture: Option<String>,
    /// Operating system, when recorded in the config.
    pub os: Option<String>,
}

/// Inspect an OCI image layout directory.
///
/// Follows `index.json` to the first manifest, then the manifest to the
/// config blob, and extracts labels and platform information from it.
pub fn inspect_layout(dir: &Path, reference: &str) -> KilnResult<ImageDetails> {
    if !dir.join("oci-layout").is_file() {
        return Err(KilnError::Config {
            message: format!("{} is not an OCI image layout", dir.display()),
        });
    }

    let index: serde_json::Value = read_json(&dir.join("index.json"))?;
    let manifest_digest = index["manifests"]
        .get(0)
        .and_then(|m| m["digest"].as_str())
        .ok_or_else(|| KilnError::Config {
            message: format!("no manifests in {}", dir.display()),
        })?
        .to_string();

    let manifest: serde_json::Value = read_json(&blob_path(dir, &manifest_digest)?)?;
    let config_digest = manifest["config"]["digest"]
        .as_str()
        .ok_or_else(|| KilnError::Config {
            message: "manifest has no config descriptor".to_string(),
        })?;

    let config: serde_json::Value = read_json(&blob_path(dir, config_digest)?)?;
    let labels = config["config"]["Labels"]
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
                .collect()
        })
        .unwrap_or_default();

    Ok(ImageDetails {
        reference: reference.to_string(),
        digest: manifest_digest,
        labels,
        architecture: config["architecture"].as_str().map(String::from),
        os: config["os"].as_str().map(String::from),
    })
}

fn blob_path(dir: &Path, digest: &str) -> KilnResult<std::path::PathBuf> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| KilnError::Config {
        message: format!("invalid digest: {digest}"),
    })?;
    Ok(dir.join("blobs").join(algorithm).join(hex))
}

fn read_json(path: &Path) -> KilnResult<serde_json::Value> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| KilnError::Config {
        message: format!("invalid JSON in {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::fs;

    fn write_blob(dir: &Path, content: &[u8]) -> String {
        let digest = format!("{:x}", Sha256::digest(content));
        let blobs = dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(blobs.join(&digest), content).unwrap();
        format!("sha256:{digest}")
    }

    #[test]
    fn inspect_minimal_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": { "test": "VALUE" } },
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = write_blob(root, &config_bytes);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": { "digest": config_digest, "size": config_bytes.len() },
            "layers": [],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = write_blob(root, &manifest_bytes);

        fs::write(root.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        fs::write(
            root.join("index.json"),
            serde_json::to_vec(&serde_json::json!({
                "manifests": [{ "digest": manifest_digest }],
            }))
            .unwrap(),
        )
        .unwrap();

        let details = inspect_layout(root, "test-repo:abc").unwrap();
        assert_eq!(details.digest, manifest_digest);
        assert_eq!(details.labels.get("test").map(String::as_str), Some("VALUE"));
        assert_eq!(details.architecture.as_deref(), Some("amd64"));
    }

    #[test]
    fn inspect_rejects_non_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect_layout(dir.path(), "x").is_err());
    }
}
