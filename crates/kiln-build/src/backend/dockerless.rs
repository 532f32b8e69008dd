//! Daemonless builds into a local OCI image layout store.
//!
//! Without a daemon the build cannot execute RUN instructions; instead it
//! materializes a deterministic OCI layout whose identity is fully derived
//! from the build inputs. Identical inputs therefore always produce
//! byte-identical layouts, which preserves the cache-key contract of the
//! prebuild hash in environments where no container runtime exists.

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use kiln_common::{KilnError, KilnResult};
use kiln_image::OciStore;

use super::{BuildBackend, BuildTarget, BuildUnit, ImageResult, parse_label_options};
use crate::dockerfile::rename_final_stage;
use crate::hash::CANONICAL_STAGE;

/// Backend writing deterministic OCI image layouts, one per target.
#[derive(Debug, Clone)]
pub struct DocklessBackend {
    store: OciStore,
}

impl DocklessBackend {
    /// Create a backend writing into the given store.
    #[must_use]
    pub fn new(store: OciStore) -> Self {
        Self { store }
    }

    /// The store this backend writes into.
    #[must_use]
    pub fn store(&self) -> &OciStore {
        &self.store
    }

    fn write_layout(&self, unit: &BuildUnit, target: &BuildTarget) -> KilnResult<ImageResult> {
        let layer = rename_final_stage(&unit.dockerfile.content, CANONICAL_STAGE)?;
        let labels = parse_label_options(&unit.options);
        let platform = &target.platform;

        let layer_digest = format!("sha256:{:x}", Sha256::digest(layer.as_bytes()));
        let config = serde_json::json!({
            "architecture": platform.arch,
            "os": platform.os,
            "config": { "Labels": labels },
            "rootfs": {
                "type": "layers",
                "diff_ids": [layer_digest],
            },
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = format!("sha256:{:x}", Sha256::digest(&config_bytes));

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = format!("sha256:{:x}", Sha256::digest(&manifest_bytes));

        let dir = self.store.image_dir(&target.destination);
        write_blob(&dir, &layer_digest, layer.as_bytes())?;
        write_blob(&dir, &config_digest, &config_bytes)?;
        write_blob(&dir, &manifest_digest, &manifest_bytes)?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest_bytes.len(),
                "platform": { "architecture": platform.arch, "os": platform.os },
                "annotations": { "org.opencontainers.image.ref.name": target.destination },
            }],
        });
        std::fs::write(dir.join("index.json"), serde_json::to_vec(&index)?)?;
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;

        tracing::info!(
            reference = %target.destination,
            digest = %manifest_digest,
            "Materialized image layout"
        );
        Ok(ImageResult {
            reference: target.destination.clone(),
            platform: platform.clone(),
            labels,
            digest: manifest_digest,
        })
    }
}

fn write_blob(dir: &Path, digest: &str, content: &[u8]) -> KilnResult<()> {
    let (algorithm, hex) = digest.split_once(':').ok_or_else(|| KilnError::Internal {
        message: format!("invalid digest: {digest}"),
    })?;
    let blobs = dir.join("blobs").join(algorithm);
    std::fs::create_dir_all(&blobs)?;
    std::fs::write(blobs.join(hex), content)?;
    Ok(())
}

#[async_trait]
impl BuildBackend for DocklessBackend {
    fn id(&self) -> &'static str {
        "dockerless"
    }

    fn supports_multi_platform(&self) -> bool {
        false
    }

    async fn build(&self, unit: &BuildUnit) -> KilnResult<Vec<ImageResult>> {
        if unit.targets.len() != 1 {
            return Err(KilnError::Internal {
                message: format!(
                    "dockerless backend takes one platform per invocation, got {}",
                    unit.targets.len()
                ),
            });
        }

        Ok(vec![self.write_layout(unit, &unit.targets[0])?])
    }
}
