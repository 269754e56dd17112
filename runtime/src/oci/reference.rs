//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/org/app:v1` into structured components
//! and rejects references that no registry would accept.

use stagecraft_core::error::{BuildError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Maximum tag length accepted by registries.
const MAX_TAG_LEN: usize = 128;

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "library/alpine", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.19` → docker.io/library/alpine:3.19
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BuildError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(BuildError::InvalidReference(format!(
                "'{}' contains whitespace",
                reference
            )));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                validate_digest(reference, digest)?;
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // belongs to a registry port.
        let last_slash = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = &tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry_repository(reference, name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Whether this reference is pinned by content digest.
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    // The first component is a registry if it looks like a hostname
    // (contains a dot or colon, or is "localhost").
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        // Single name like "alpine" → "library/alpine" on Docker Hub
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    if repository.is_empty() || !repository.split('/').all(is_path_component) {
        return Err(BuildError::InvalidReference(format!(
            "'{}' has an invalid repository name (expected lowercase [a-z0-9] separated by '.', '_' or '-')",
            reference
        )));
    }

    Ok((registry, repository))
}

/// `[a-z0-9]+` runs joined by single separators.
fn is_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let is_sep = |b: u8| matches!(b, b'.' | b'_' | b'-');

    if bytes.is_empty() || !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    bytes.iter().all(|&b| is_alnum(b) || is_sep(b))
        && !bytes.windows(2).any(|w| is_sep(w[0]) && is_sep(w[1]) && w != b"__")
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BuildError::InvalidReference(format!(
            "'{}' has an invalid tag '{}'",
            reference, tag
        )))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    match digest.split_once(':') {
        Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => Ok(()),
        _ => Err(BuildError::InvalidReference(format!(
            "invalid digest format in '{}': expected algorithm:hex",
            reference
        ))),
    }
}
