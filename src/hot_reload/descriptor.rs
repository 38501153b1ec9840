//! Reload descriptor parsing.
//!
//! The core reads only the `include` field of a descriptor (a string or an
//! array of strings, resolved relative to the descriptor's directory); every
//! other field is opaque and forwarded to the artifact producer.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{io_error, CoreError, CoreResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IncludeField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
struct DescriptorSubset {
    #[serde(default)]
    include: Option<IncludeField>,
}

/// Parse the `include` references of a descriptor document.
pub fn includes_of_bytes(path: &Path, bytes: &[u8]) -> CoreResult<Vec<PathBuf>> {
    let subset: DescriptorSubset =
        serde_json::from_slice(bytes).map_err(|e| CoreError::SerializationError {
            message: format!("descriptor {}: {}", path.display(), e),
        })?;

    let raw = match subset.include {
        None => return Ok(Vec::new()),
        Some(IncludeField::One(include)) => vec![include],
        Some(IncludeField::Many(includes)) => includes,
    };

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut resolved = Vec::with_capacity(raw.len());
    for include in raw {
        let candidate = if Path::new(&include).is_absolute() {
            PathBuf::from(&include)
        } else {
            base.join(&include)
        };
        // Canonicalise when the target exists; keep the lexical join so a
        // dangling include still participates in the dependency graph.
        let path = std::fs::canonicalize(&candidate).unwrap_or(candidate);
        resolved.push(path);
    }
    Ok(resolved)
}

/// Read a descriptor file and parse its `include` references.
pub fn includes_of(path: &Path) -> CoreResult<Vec<PathBuf>> {
    let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;
    includes_of_bytes(path, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_include() {
        let includes =
            includes_of_bytes(Path::new("/ui/main.json"), br#"{"type": "Button"}"#).expect("parse");
        assert!(includes.is_empty());
    }

    #[test]
    fn test_single_include_resolves_relative() {
        let includes = includes_of_bytes(
            Path::new("/ui/main.json"),
            br#"{"type": "Panel", "include": "part.json"}"#,
        )
        .expect("parse");
        assert_eq!(includes, vec![PathBuf::from("/ui/part.json")]);
    }

    #[test]
    fn test_include_array() {
        let includes = includes_of_bytes(
            Path::new("/ui/main.json"),
            br#"{"include": ["a.json", "/abs/b.json"]}"#,
        )
        .expect("parse");
        assert_eq!(
            includes,
            vec![PathBuf::from("/ui/a.json"), PathBuf::from("/abs/b.json")]
        );
    }

    #[test]
    fn test_malformed_descriptor() {
        let err =
            includes_of_bytes(Path::new("/ui/bad.json"), b"{ not json").expect_err("malformed");
        assert_eq!(err.code(), "core.serde");
    }
}
