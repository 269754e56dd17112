//! `COPY` filesystem semantics.
//!
//! Sources are resolved inside a read-only source root (build context,
//! completed stage rootfs or unpacked image) and written into the current
//! stage's rootfs. Every path written is reported, relative to the rootfs, so
//! the layer holds exactly what the copy produced.

use std::path::{Component, Path, PathBuf};

use stagecraft_core::error::{BuildError, Result};

/// Resolve `path` under `root`, refusing anything that climbs above it.
/// Absolute and relative paths are both taken relative to `root`.
pub fn contained_path(path: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(BuildError::Other(format!(
                        "path '{}' escapes its root",
                        path
                    )));
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(normalized)
}

/// Resolve `path` against the working directory; absolute paths win.
pub fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

/// Copy `sources` from `src_root` to `dst` inside `rootfs`.
///
/// Directory sources copy their contents. A destination ending in `/`, or a
/// copy with several sources, is treated as a directory. Returns the written
/// paths relative to `rootfs`.
pub fn copy_into(
    src_root: &Path,
    sources: &[String],
    rootfs: &Path,
    dst: &str,
    workdir: &str,
) -> Result<Vec<PathBuf>> {
    let mut matched = Vec::new();
    for source in sources {
        let found = expand_source(src_root, source)?;
        if found.is_empty() {
            return Err(BuildError::Other(format!(
                "COPY source not found: {}",
                source
            )));
        }
        matched.extend(found);
    }

    let dst_rel = contained_path(&resolve_path(workdir, dst))?;
    let dst_full = rootfs.join(&dst_rel);
    let into_dir = dst.ends_with('/') || dst_full.is_dir();

    if matched.len() > 1 && !into_dir {
        return Err(BuildError::Other(format!(
            "COPY with more than one source requires a directory destination ending in '/', got '{}'",
            dst
        )));
    }

    let mut written = Vec::new();
    for src in &matched {
        let metadata = std::fs::symlink_metadata(src).map_err(|e| io_error("stat", src, e))?;
        if metadata.is_dir() {
            ensure_dir(rootfs, &dst_rel, &mut written)?;
            copy_tree(src, rootfs, &dst_rel, &mut written)?;
        } else {
            let target = if into_dir {
                ensure_dir(rootfs, &dst_rel, &mut written)?;
                match src.file_name() {
                    Some(name) => dst_rel.join(name),
                    None => dst_rel.clone(),
                }
            } else {
                if let Some(parent) = dst_rel.parent() {
                    ensure_dir(rootfs, parent, &mut written)?;
                }
                dst_rel.clone()
            };
            copy_entry(src, &metadata, rootfs, &target)?;
            written.push(target);
        }
    }

    Ok(written)
}

/// Replicate the tree under `src` into the empty directory `dst`.
pub fn replicate(src: &Path, dst: &Path) -> Result<()> {
    let mut written = Vec::new();
    copy_tree(src, dst, Path::new(""), &mut written)?;
    tracing::debug!(
        from = %src.display(),
        to = %dst.display(),
        entries = written.len(),
        "Replicated filesystem"
    );
    Ok(())
}

/// Expand a source path, honoring glob wildcards (`*`, `?`, `[...]`) in its
/// last component.
fn expand_source(src_root: &Path, source: &str) -> Result<Vec<PathBuf>> {
    let relative = contained_path(source)?;
    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if !name.contains(['*', '?', '[']) {
        let full = src_root.join(&relative);
        return Ok(if std::fs::symlink_metadata(&full).is_ok() {
            vec![full]
        } else {
            Vec::new()
        });
    }

    let pattern = glob::Pattern::new(&name).map_err(|e| {
        BuildError::Other(format!("invalid COPY pattern '{}': {}", source, e))
    })?;
    let parent = src_root.join(relative.parent().unwrap_or(Path::new("")));
    let Ok(read_dir) = std::fs::read_dir(&parent) else {
        return Ok(Vec::new());
    };
    let mut matches: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| pattern.matches(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    matches.sort();
    Ok(matches)
}

/// Create the absolute directory `path` inside `rootfs`. Returns the
/// directories that did not exist before.
pub fn make_dir(rootfs: &Path, path: &str) -> Result<Vec<PathBuf>> {
    let relative = contained_path(path)?;
    let mut written = Vec::new();
    ensure_dir(rootfs, &relative, &mut written)?;
    Ok(written)
}

/// Create `relative` and any missing parents, recording the ones created.
fn ensure_dir(rootfs: &Path, relative: &Path, written: &mut Vec<PathBuf>) -> Result<()> {
    let mut current = PathBuf::new();
    for component in relative.components() {
        current.push(component);
        let full = rootfs.join(&current);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(BuildError::Other(format!(
                    "cannot create directory /{}: a file is in the way",
                    current.display()
                )))
            }
            Err(_) => {
                std::fs::create_dir(&full).map_err(|e| io_error("create", &full, e))?;
                written.push(current.clone());
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, rootfs: &Path, dst_rel: &Path, written: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(src)
        .map_err(|e| io_error("read", src, e))?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let src_path = entry.path();
        let target = dst_rel.join(entry.file_name());
        let metadata =
            std::fs::symlink_metadata(&src_path).map_err(|e| io_error("stat", &src_path, e))?;

        if metadata.is_dir() {
            let full = rootfs.join(&target);
            if !full.is_dir() {
                copy_entry(&src_path, &metadata, rootfs, &target)?;
            }
            written.push(target.clone());
            copy_tree(&src_path, rootfs, &target, written)?;
        } else {
            copy_entry(&src_path, &metadata, rootfs, &target)?;
            written.push(target);
        }
    }
    Ok(())
}

/// Copy one file, symlink or (empty) directory. An existing non-directory at
/// the target is replaced rather than written through.
fn copy_entry(src: &Path, metadata: &std::fs::Metadata, rootfs: &Path, target: &Path) -> Result<()> {
    let full = rootfs.join(target);
    if let Ok(existing) = std::fs::symlink_metadata(&full) {
        if !existing.is_dir() {
            std::fs::remove_file(&full).map_err(|e| io_error("replace", &full, e))?;
        } else if !metadata.is_dir() {
            return Err(BuildError::Other(format!(
                "cannot overwrite directory /{} with a file",
                target.display()
            )));
        }
    }

    if metadata.file_type().is_symlink() {
        let link = std::fs::read_link(src).map_err(|e| io_error("read link", src, e))?;
        return symlink(&link, &full);
    }
    if metadata.is_dir() {
        std::fs::create_dir(&full).map_err(|e| io_error("create", &full, e))?;
        return std::fs::set_permissions(&full, metadata.permissions())
            .map_err(|e| io_error("chmod", &full, e));
    }
    std::fs::copy(src, &full)
        .map(|_| ())
        .map_err(|e| io_error("copy", src, e))
}

#[cfg(unix)]
fn symlink(link: &Path, full: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, full).map_err(|e| io_error("symlink", full, e))
}

#[cfg(not(unix))]
fn symlink(link: &Path, full: &Path) -> Result<()> {
    Err(BuildError::Other(format!(
        "cannot copy symlink {} -> {} on this platform",
        full.display(),
        link.display()
    )))
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> BuildError {
    BuildError::Other(format!("Failed to {} {}: {}", action, path.display(), e))
}
