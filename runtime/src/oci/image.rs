//! OCI image layout loading.
//!
//! Reads an OCI image layout (`oci-layout`, `index.json`, `blobs/`) and
//! exposes the manifest's layer blobs and the runtime configuration.

use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};
use stagecraft_core::error::{BuildError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// An OCI image loaded from disk.
#[derive(Debug, Clone)]
pub struct OciImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Image configuration
    config: ImageConfig,

    /// Layer blobs, bottom to top
    layers: Vec<ImageLayer>,
}

/// A layer blob referenced by an image manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageLayer {
    /// Path to the compressed blob
    pub path: PathBuf,
    /// Compressed digest, `sha256:` prefixed
    pub digest: String,
    /// Uncompressed digest from the config's rootfs, `sha256:` prefixed
    pub diff_id: Option<String>,
    /// Blob size in bytes
    pub size: u64,
}

/// Runtime configuration carried by an image and inherited by stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageConfig {
    /// Entrypoint command
    pub entrypoint: Option<Vec<String>>,

    /// Default command arguments
    pub cmd: Option<Vec<String>>,

    /// Environment variables, in declaration order
    pub env: Vec<(String, String)>,

    /// Working directory
    pub working_dir: Option<String>,

    /// User to run as
    pub user: Option<String>,

    /// Exposed ports
    pub exposed_ports: Vec<String>,

    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// Set or replace an environment variable.
    pub fn set_env(&mut self, key: &str, value: String) {
        match self.env.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value,
            None => self.env.push((key.to_string(), value)),
        }
    }

    /// Look up an environment variable.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render as the `config` object of an OCI image configuration.
    pub fn to_oci_json(&self) -> serde_json::Value {
        let mut section = serde_json::Map::new();
        if !self.env.is_empty() {
            let env: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            section.insert("Env".to_string(), serde_json::json!(env));
        }
        if let Some(ref ep) = self.entrypoint {
            section.insert("Entrypoint".to_string(), serde_json::json!(ep));
        }
        if let Some(ref cmd) = self.cmd {
            section.insert("Cmd".to_string(), serde_json::json!(cmd));
        }
        if let Some(ref wd) = self.working_dir {
            section.insert("WorkingDir".to_string(), serde_json::json!(wd));
        }
        if let Some(ref user) = self.user {
            section.insert("User".to_string(), serde_json::json!(user));
        }
        if !self.exposed_ports.is_empty() {
            let ports: serde_json::Map<String, serde_json::Value> = self
                .exposed_ports
                .iter()
                .map(|p| (p.clone(), serde_json::json!({})))
                .collect();
            section.insert("ExposedPorts".to_string(), serde_json::Value::Object(ports));
        }
        if !self.labels.is_empty() {
            section.insert("Labels".to_string(), serde_json::json!(self.labels));
        }
        serde_json::Value::Object(section)
    }

    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let Some(config) = oci_config.config().as_ref() else {
            return Self::default();
        };

        let env = config
            .env()
            .as_ref()
            .map(|env_list| {
                env_list
                    .iter()
                    .filter_map(|e| e.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            entrypoint: config.entrypoint().clone(),
            cmd: config.cmd().clone(),
            env,
            working_dir: config.working_dir().clone(),
            user: config.user().clone(),
            exposed_ports: config.exposed_ports().clone().unwrap_or_default(),
            labels: config
                .labels()
                .clone()
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_default(),
        }
    }
}

impl OciImage {
    /// Load an OCI image from a directory.
    ///
    /// The directory must contain a valid OCI image layout:
    /// - oci-layout file
    /// - index.json
    /// - blobs/sha256/ directory with manifest, config, and layers
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;

        let index: ImageIndex = Self::load_json(&root_dir.join("index.json"), "index.json")?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| BuildError::Other("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            Self::load_json(&Self::blob_path(&root_dir, &manifest_digest), "manifest")?;
        let oci_config: ImageConfiguration = Self::load_json(
            &Self::blob_path(&root_dir, manifest.config().digest()),
            "config",
        )?;

        let diff_ids = oci_config.rootfs().diff_ids();
        let layers = manifest
            .layers()
            .iter()
            .enumerate()
            .map(|(i, layer)| ImageLayer {
                path: Self::blob_path(&root_dir, layer.digest()),
                digest: layer.digest().to_string(),
                diff_id: diff_ids.get(i).cloned(),
                size: layer.size().max(0) as u64,
            })
            .collect();

        Ok(Self {
            root_dir,
            config: ImageConfig::from_oci_config(&oci_config),
            layers,
        })
    }

    /// Get the image configuration.
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Get all layer blobs (bottom to top).
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }

    /// Get the root directory of the OCI image.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Validate that the directory contains a valid OCI layout.
    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(BuildError::Other(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    fn load_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Other(format!(
                "Failed to read {} at {}: {}",
                what,
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| BuildError::Other(format!("Failed to parse {}: {}", what, e)))
    }

    /// Get the path to a blob by digest.
    fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        root_dir.join("blobs").join(algorithm).join(hash)
    }
}
