//! OCI layer extraction.
//!
//! Unpacks gzip-compressed layer tarballs onto a root filesystem directory.

use flate2::read::GzDecoder;
use stagecraft_core::error::{BuildError, Result};
use std::fs::File;
use std::path::Path;
use tar::Archive;

/// Deleted-path marker prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque directory marker: hide everything below the directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract a single OCI layer (tar.gz) into `target_dir`.
///
/// Later layers overwrite files from earlier ones, so layers must be applied
/// bottom to top.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(BuildError::Other(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        BuildError::Other(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        BuildError::Other(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(true);
    let entries = archive
        .entries()
        .map_err(|e| BuildError::Other(format!("Failed to read layer entries: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::Other(format!("Failed to read layer entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::Other(format!("Invalid path in layer: {}", e)))?
            .into_owned();

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                apply_whiteout(target_dir, &path, hidden)?;
                continue;
            }
        }

        entry.unpack_in(target_dir).map_err(|e| {
            BuildError::Other(format!(
                "Failed to extract layer to {}: {}",
                target_dir.display(),
                e
            ))
        })?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}

/// Remove the path a whiteout entry hides. Paths escaping `target_dir` are
/// ignored.
fn apply_whiteout(target_dir: &Path, entry_path: &Path, hidden: &str) -> Result<()> {
    if entry_path
        .components()
        .any(|c| !matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
    {
        return Ok(());
    }
    let parent = target_dir.join(entry_path.parent().unwrap_or(Path::new("")));

    let doomed: Vec<std::path::PathBuf> = if entry_path.file_name() == Some(std::ffi::OsStr::new(OPAQUE_WHITEOUT)) {
        match std::fs::read_dir(&parent) {
            Ok(read_dir) => read_dir.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    } else {
        vec![parent.join(hidden)]
    };

    for path in doomed {
        let removed = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(_) => continue,
        };
        removed.map_err(|e| {
            BuildError::Other(format!("Failed to apply whiteout {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}
