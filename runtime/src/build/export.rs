//! Final image export.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stagecraft_core::error::{BuildError, Result};

use super::artifacts::{FinalImage, HistoryEntry, Layer};
use super::layer::sha256_bytes;
use crate::oci::ImageConfig;

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Summary of an exported image.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedImage {
    pub reference: String,
    /// Manifest digest, `sha256:` prefixed
    pub digest: String,
    /// Total size of the layer blobs
    pub size: u64,
    pub layer_count: usize,
    /// Where the image was written
    pub path: PathBuf,
}

/// Receives the final image of a successful build.
#[async_trait]
pub trait ImageExporter: Send + Sync {
    async fn export(&self, image: &FinalImage, reference: &str) -> Result<ExportedImage>;
}

/// Writes the final image as an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayoutExporter {
    dir: PathBuf,
}

impl OciLayoutExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ImageExporter for OciLayoutExporter {
    async fn export(&self, image: &FinalImage, reference: &str) -> Result<ExportedImage> {
        let layers = image.layers().to_vec();
        let history = image.history().to_vec();
        let config = image.config().clone();
        let dir = self.dir.clone();
        let reference = reference.to_string();

        let exported = tokio::task::spawn_blocking(move || {
            write_layout(&dir, &reference, &layers, &history, &config)
        })
        .await
        .map_err(|e| BuildError::Other(format!("Image export task failed: {}", e)))??;

        tracing::info!(
            reference = %exported.reference,
            digest = %exported.digest,
            layers = exported.layer_count,
            size = %format_size(exported.size),
            "Exported image"
        );
        Ok(exported)
    }
}

fn write_layout(
    dir: &Path,
    reference: &str,
    layers: &[Layer],
    history: &[HistoryEntry],
    config: &ImageConfig,
) -> Result<ExportedImage> {
    let blobs_dir = dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        BuildError::Other(format!("Failed to create output blobs dir: {}", e))
    })?;

    let mut descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        let hex = layer.digest.trim_start_matches("sha256:");
        let blob_path = blobs_dir.join(hex);
        if !blob_path.exists() {
            std::fs::copy(&layer.path, &blob_path).map_err(|e| {
                BuildError::Other(format!(
                    "Failed to copy layer {} ({}): {}",
                    layer.digest, layer.created_by, e
                ))
            })?;
        }
        descriptors.push(serde_json::json!({
            "mediaType": LAYER_MEDIA_TYPE,
            "digest": layer.digest,
            "size": layer.size
        }));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    let image_config = serde_json::json!({
        "architecture": arch,
        "os": "linux",
        "created": now,
        "config": config.to_oci_json(),
        "rootfs": {
            "type": "layers",
            "diff_ids": layers.iter().map(|l| l.diff_id.as_str()).collect::<Vec<_>>()
        },
        "history": history.iter().map(|h| {
            let mut entry = serde_json::json!({
                "created": now,
                "created_by": h.created_by
            });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        }).collect::<Vec<_>>()
    });

    let config_bytes = serde_json::to_vec_pretty(&image_config)?;
    let config_digest = sha256_bytes(&config_bytes);
    std::fs::write(blobs_dir.join(&config_digest), &config_bytes).map_err(|e| {
        BuildError::Other(format!("Failed to write config blob: {}", e))
    })?;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MANIFEST_MEDIA_TYPE,
        "config": {
            "mediaType": CONFIG_MEDIA_TYPE,
            "digest": format!("sha256:{}", config_digest),
            "size": config_bytes.len()
        },
        "layers": descriptors
    });
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    std::fs::write(blobs_dir.join(&manifest_digest), &manifest_bytes).map_err(|e| {
        BuildError::Other(format!("Failed to write manifest blob: {}", e))
    })?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": INDEX_MEDIA_TYPE,
        "manifests": [{
            "mediaType": MANIFEST_MEDIA_TYPE,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len(),
            "annotations": { REF_NAME_ANNOTATION: reference }
        }]
    });
    std::fs::write(dir.join("index.json"), serde_json::to_string_pretty(&index)?)
        .map_err(|e| BuildError::Other(format!("Failed to write index.json: {}", e)))?;
    std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)
        .map_err(|e| BuildError::Other(format!("Failed to write oci-layout: {}", e)))?;

    Ok(ExportedImage {
        reference: reference.to_string(),
        digest: format!("sha256:{}", manifest_digest),
        size: layers.iter().map(|l| l.size).sum(),
        layer_count: layers.len(),
        path: dir.to_path_buf(),
    })
}

/// Format a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::artifacts::{ArtifactManager, StageBase, StageWorkspace};
    use crate::build::dockerfile::Dockerfile;
    use crate::build::graph::{StageGraph, StageId};
    use crate::build::layer::{create_layer, Changes};
    use crate::build::resolve::BuildGraph;
    use crate::oci::OciImage;
    use stagecraft_core::event::EventEmitter;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn single_stage_image(manager: &ArtifactManager) -> FinalImage {
        let df = Dockerfile::parse("FROM scratch\nCOPY app /app").unwrap();
        let graph = BuildGraph::resolve(StageGraph::build(&df, &HashMap::new()).unwrap()).unwrap();

        let arena = manager.allocate(StageId(0)).unwrap();
        let mut ws = StageWorkspace::new(StageId(0), "#0".to_string(), arena, StageBase::Scratch);
        std::fs::write(ws.rootfs().join("app"), "binary").unwrap();
        let blob = create_layer(
            ws.rootfs(),
            &Changes::written(vec![PathBuf::from("app")]),
            ws.layers_dir(),
        )
        .unwrap();
        ws.push_layer(blob, "COPY app /app");
        ws.config.set_env("MODE", "release".to_string());
        ws.config.cmd = Some(vec!["/app".to_string()]);
        ws.push_history("CMD [\"/app\"]");

        let completed = BTreeMap::from([(StageId(0), Arc::new(ws.complete()))]);
        manager.finalize(&graph, StageId(0), completed).unwrap().0
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.0 GB");
    }

    #[tokio::test]
    async fn test_export_loads_as_oci_image() {
        let scratch = Arc::new(TempDir::new().unwrap());
        let manager = ArtifactManager::new(scratch, EventEmitter::default());
        let image = single_stage_image(&manager);
        let out = TempDir::new().unwrap();

        let exported = OciLayoutExporter::new(out.path())
            .export(&image, "app:1.0")
            .await
            .unwrap();

        assert!(exported.digest.starts_with("sha256:"));
        assert_eq!(exported.layer_count, 1);
        assert_eq!(exported.size, image.size());

        let loaded = OciImage::from_path(out.path()).unwrap();
        assert_eq!(loaded.layers().len(), 1);
        assert_eq!(loaded.layers()[0].digest, image.layers()[0].digest);
        assert_eq!(
            loaded.layers()[0].diff_id.as_deref(),
            Some(image.layers()[0].diff_id.as_str())
        );
        assert_eq!(loaded.config().env_var("MODE"), Some("release"));
        assert_eq!(loaded.config().cmd, Some(vec!["/app".to_string()]));

        let index: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join("index.json")).unwrap())
                .unwrap();
        assert_eq!(
            index["manifests"][0]["annotations"][REF_NAME_ANNOTATION],
            "app:1.0"
        );
    }
}
