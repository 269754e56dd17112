//! Layer creation utilities.
//!
//! Filesystem snapshotting and diffing around `RUN`, and content-addressed
//! tar.gz layer creation for both `RUN` and `COPY` results.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use stagecraft_core::error::{BuildError, Result};

/// Prefix marking a deleted path inside a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// A snapshot of a directory tree's metadata.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Relative path → entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths added, modified or removed between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    /// Added or modified, sorted so parents precede children
    pub changed: Vec<PathBuf>,
    /// Removed, topmost paths only
    pub removed: Vec<PathBuf>,
}

impl Changes {
    /// A set of written paths with nothing removed (`COPY`).
    pub fn written(mut paths: Vec<PathBuf>) -> Self {
        paths.sort();
        paths.dedup();
        Self {
            changed: paths,
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

impl DirSnapshot {
    /// Record every path under `root`. Symlinks are not followed.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Changes from this snapshot (before) to `after`.
    pub fn diff(&self, after: &DirSnapshot) -> Changes {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                None => true,
                Some(before) if before.is_dir && entry.is_dir => before.mode != entry.mode,
                Some(before) => before != *entry,
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();

        let gone: Vec<&PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .collect();
        let mut removed: Vec<PathBuf> = gone
            .iter()
            .filter(|path| {
                !path
                    .ancestors()
                    .skip(1)
                    .any(|ancestor| gone.iter().any(|g| g.as_path() == ancestor))
            })
            .map(|path| (*path).clone())
            .collect();
        removed.sort();

        Changes { changed, removed }
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BuildError::Other(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry =
            entry.map_err(|e| BuildError::Other(format!("Failed to read directory entry: {}", e)))?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            BuildError::Other(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_dir = metadata.is_dir();
        entries.insert(
            relative,
            FileEntry {
                size: if is_dir { 0 } else { metadata.len() },
                modified: metadata.modified().ok(),
                mode: file_mode(&metadata),
                is_dir,
                is_symlink: metadata.file_type().is_symlink(),
            },
        );

        if is_dir {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// A layer blob written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerBlob {
    /// `<layers_dir>/<hex>.tar.gz`
    pub path: PathBuf,
    /// SHA-256 of the compressed blob, `sha256:` prefixed
    pub digest: String,
    /// SHA-256 of the uncompressed tar, `sha256:` prefixed
    pub diff_id: String,
    pub size: u64,
}

/// Write a tar.gz layer holding `changes` from `rootfs` into `layers_dir`.
///
/// The blob is named after its own digest. Removed paths become whiteout
/// entries. Headers are deterministic so identical content gives identical
/// digests.
pub fn create_layer(rootfs: &Path, changes: &Changes, layers_dir: &Path) -> Result<LayerBlob> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let staging = tempfile::NamedTempFile::new_in(layers_dir).map_err(|e| {
        BuildError::Other(format!(
            "Failed to create layer file in {}: {}",
            layers_dir.display(),
            e
        ))
    })?;
    let file = staging
        .reopen()
        .map_err(|e| BuildError::Other(format!("Failed to open layer file: {}", e)))?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(HashingWriter::new(encoder));
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Deterministic);

    for relative in &changes.changed {
        let full_path = rootfs.join(relative);
        let Ok(metadata) = std::fs::symlink_metadata(&full_path) else {
            continue;
        };

        let appended = if metadata.is_dir() {
            builder.append_dir(relative, &full_path)
        } else {
            builder.append_path_with_name(&full_path, relative)
        };
        appended.map_err(|e| {
            BuildError::Other(format!(
                "Failed to add {} to layer: {}",
                relative.display(),
                e
            ))
        })?;
    }

    for relative in &changes.removed {
        let Some(name) = relative.file_name() else {
            continue;
        };
        let whiteout = relative.with_file_name(format!(
            "{}{}",
            WHITEOUT_PREFIX,
            name.to_string_lossy()
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &whiteout, std::io::empty())
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to add whiteout for {}: {}",
                    relative.display(),
                    e
                ))
            })?;
    }

    let hashing = builder
        .into_inner()
        .map_err(|e| BuildError::Other(format!("Failed to finalize layer: {}", e)))?;
    let (encoder, diff_id) = hashing.finish();
    encoder
        .finish()
        .map_err(|e| BuildError::Other(format!("Failed to compress layer: {}", e)))?;

    let hex_digest = sha256_file(staging.path())?;
    let path = layers_dir.join(format!("{}.tar.gz", hex_digest));
    staging.persist(&path).map_err(|e| {
        BuildError::Other(format!(
            "Failed to store layer {}: {}",
            path.display(),
            e.error
        ))
    })?;
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    Ok(LayerBlob {
        path,
        digest: format!("sha256:{}", hex_digest),
        diff_id: format!("sha256:{}", diff_id),
        size,
    })
}

/// Writer that hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Returns the inner writer and the hex digest of the bytes written.
    fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        BuildError::Other(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| {
        BuildError::Other(format!("Failed to hash {}: {}", path.display(), e))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// `sha256:`-prefixed digest of a gzip layer's uncompressed content.
pub fn diff_id_of(layer_path: &Path) -> Result<String> {
    let file = std::fs::File::open(layer_path).map_err(|e| {
        BuildError::Other(format!(
            "Failed to read layer for diff_id {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut decoder, &mut hasher)
        .map_err(|e| BuildError::Other(format!("Failed to decompress layer for diff_id: {}", e)))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Hex SHA-256 of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
