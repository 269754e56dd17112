//! External image access.
//!
//! `ImageSource` is the seam to whatever transport provides base images.
//! `FetchCache` fetches and unpacks each referenced image once per build and
//! shares the unpacked, read-only filesystem between stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use stagecraft_core::error::{BuildError, Result};
use tempfile::TempDir;
use tokio::sync::OnceCell;

use super::artifacts::{Layer, LayerOwner};
use super::layer::diff_id_of;
use crate::oci::{extract_layer, ImageConfig, ImageReference, OciImage};

/// Provides external images as OCI image layouts on local disk.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Make `reference` available and load its layout.
    async fn fetch(&self, reference: &ImageReference) -> Result<OciImage>;
}

/// Reads images from a directory tree of OCI layouts:
/// `<root>/<registry>/<repository>/<tag>` or
/// `<root>/<registry>/<repository>/<algorithm>_<hex>` for pinned references.
#[derive(Debug, Clone)]
pub struct LayoutImageSource {
    root: PathBuf,
}

impl LayoutImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the layout for `reference`.
    pub fn layout_dir(&self, reference: &ImageReference) -> PathBuf {
        let leaf = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.replace(':', "_"),
            (None, Some(tag)) => tag.clone(),
            (None, None) => "latest".to_string(),
        };
        self.root
            .join(&reference.registry)
            .join(&reference.repository)
            .join(leaf)
    }
}

#[async_trait]
impl ImageSource for LayoutImageSource {
    async fn fetch(&self, reference: &ImageReference) -> Result<OciImage> {
        let dir = self.layout_dir(reference);
        if !dir.is_dir() {
            return Err(BuildError::Other(format!(
                "image not found (no layout at {})",
                dir.display()
            )));
        }
        tokio::task::spawn_blocking(move || OciImage::from_path(&dir))
            .await
            .map_err(|e| BuildError::Other(format!("Image load task failed: {}", e)))?
    }
}

/// An external image unpacked into build scratch space.
#[derive(Debug)]
pub struct FetchedImage {
    reference: ImageReference,
    config: ImageConfig,
    layers: Vec<Layer>,
    rootfs: PathBuf,
    _dir: TempDir,
    _scratch: Arc<TempDir>,
}

impl FetchedImage {
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Layers, bottom to top.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Unpacked filesystem. Read-only by convention.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }
}

type Slot = Arc<OnceCell<Arc<FetchedImage>>>;

/// Per-build fetch cache keyed by full reference.
pub struct FetchCache {
    source: Arc<dyn ImageSource>,
    scratch: Arc<TempDir>,
    enabled: bool,
    entries: DashMap<String, Slot>,
}

impl FetchCache {
    pub fn new(source: Arc<dyn ImageSource>, scratch: Arc<TempDir>, enabled: bool) -> Self {
        Self {
            source,
            scratch,
            enabled,
            entries: DashMap::new(),
        }
    }

    /// Fetch and unpack `reference`, reusing an earlier result when caching
    /// is enabled. Concurrent requests for one reference share a single fetch.
    pub async fn get(&self, reference: &ImageReference) -> Result<Arc<FetchedImage>> {
        if !self.enabled {
            return self.load(reference).await;
        }

        let slot = self
            .entries
            .entry(reference.full_reference())
            .or_default()
            .clone();
        slot.get_or_try_init(|| self.load(reference))
            .await
            .map(Arc::clone)
    }

    /// Number of distinct references resolved so far.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn load(&self, reference: &ImageReference) -> Result<Arc<FetchedImage>> {
        tracing::info!(reference = %reference, "Fetching external image");
        let image = self.source.fetch(reference).await?;

        let scratch = self.scratch.clone();
        let reference = reference.clone();
        tokio::task::spawn_blocking(move || unpack(image, reference, scratch))
            .await
            .map_err(|e| BuildError::Other(format!("Image unpack task failed: {}", e)))?
            .map(Arc::new)
    }
}

impl std::fmt::Debug for FetchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCache")
            .field("enabled", &self.enabled)
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn unpack(image: OciImage, reference: ImageReference, scratch: Arc<TempDir>) -> Result<FetchedImage> {
    let dir = tempfile::Builder::new()
        .prefix("image-")
        .tempdir_in(scratch.path())?;
    let rootfs = dir.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;

    let mut layers = Vec::with_capacity(image.layers().len());
    for blob in image.layers() {
        extract_layer(&blob.path, &rootfs)?;
        let diff_id = match &blob.diff_id {
            Some(diff_id) => diff_id.clone(),
            None => diff_id_of(&blob.path)?,
        };
        layers.push(Layer {
            digest: blob.digest.clone(),
            diff_id,
            size: blob.size,
            path: blob.path.clone(),
            owner: LayerOwner::Image(reference.clone()),
            created_by: format!("layer of {}", reference),
        });
    }

    tracing::debug!(
        reference = %reference,
        layers = layers.len(),
        rootfs = %rootfs.display(),
        "Unpacked external image"
    );

    Ok(FetchedImage {
        reference,
        config: image.config().clone(),
        layers,
        rootfs,
        _dir: dir,
        _scratch: scratch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MissingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageSource for MissingSource {
        async fn fetch(&self, _reference: &ImageReference) -> Result<OciImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::Other("unreachable registry".to_string()))
        }
    }

    #[test]
    fn test_layout_dir() {
        let source = LayoutImageSource::new("/images");
        let tagged = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(
            source.layout_dir(&tagged),
            PathBuf::from("/images/docker.io/library/alpine/3.19")
        );

        let pinned = ImageReference::parse("ghcr.io/org/app@sha256:abc").unwrap();
        assert_eq!(
            source.layout_dir(&pinned),
            PathBuf::from("/images/ghcr.io/org/app/sha256_abc")
        );
    }

    #[tokio::test]
    async fn test_layout_source_missing_image() {
        let dir = TempDir::new().unwrap();
        let source = LayoutImageSource::new(dir.path());
        let err = source
            .fetch(&ImageReference::parse("nothere").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("image not found"));
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let source = Arc::new(MissingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = FetchCache::new(source.clone(), Arc::new(TempDir::new().unwrap()), true);
        let reference = ImageReference::parse("alpine").unwrap();

        assert!(cache.get(&reference).await.is_err());
        assert!(cache.get(&reference).await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }
}
