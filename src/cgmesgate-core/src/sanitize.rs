//! Filename allow-list and path containment checks.
//!
//! SECURITY: every name taken from an upload or an archive entry passes
//! through here before it is used to build a filesystem path or a process
//! argument. Names are rejected, never transliterated.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};

/// Longest accepted path component, in bytes.
pub const MAX_COMPONENT_LEN: usize = 255;

/// Validate a single file or directory name.
///
/// Only ASCII alphanumerics, `.`, `-` and `_` are allowed. `.` and `..` are
/// rejected outright, so are empty and over-long names.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Sanitization("empty file name".to_string()));
    }

    if name.len() > MAX_COMPONENT_LEN {
        return Err(Error::Sanitization(format!(
            "file name too long: {} bytes (max {})",
            name.len(),
            MAX_COMPONENT_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(Error::Sanitization(format!("reserved file name: {}", name)));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(Error::Sanitization(format!(
            "invalid character {:?} in '{}' (only A-Z, a-z, 0-9, '.', '-', '_' allowed)",
            c,
            name.escape_default()
        )));
    }

    Ok(())
}

/// Normalize an archive-declared relative path.
///
/// Works on components, not on the literal string: `.` segments are
/// dropped, while `..`, absolute roots and drive prefixes are traversal
/// attempts and fail with [`Error::Archive`]. Each remaining component must
/// pass [`validate_file_name`].
pub fn normalize_relative(declared: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();

    for component in Path::new(declared).components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::Sanitization(format!("non UTF-8 path: {}", declared.escape_default()))
                })?;
                validate_file_name(part)?;
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                warn!("path={} Rejected parent-directory segment", declared.escape_default());
                return Err(Error::Archive(format!(
                    "path traversal in entry: {}",
                    declared.escape_default()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                warn!("path={} Rejected absolute entry path", declared.escape_default());
                return Err(Error::Archive(format!(
                    "absolute path in entry: {}",
                    declared.escape_default()
                )));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::Archive(format!(
            "entry resolves to the archive root: {}",
            declared.escape_default()
        )));
    }

    Ok(normalized)
}

/// Check that an existing path resolves strictly inside `root`.
///
/// Both sides are canonicalized, so symlinked parents are followed before
/// the comparison. Returns the canonical path.
pub fn ensure_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let root = fs::canonicalize(root)?;
    let resolved = fs::canonicalize(candidate).map_err(|e| {
        Error::Archive(format!("cannot resolve {}: {}", candidate.display(), e))
    })?;

    if resolved == root || !resolved.starts_with(&root) {
        warn!(
            "path={} root={} Resolved path escapes root",
            resolved.display(),
            root.display()
        );
        return Err(Error::Archive(format!(
            "{} resolves outside {}",
            candidate.display(),
            root.display()
        )));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_file_name_valid() {
        assert!(validate_file_name("model.xml").is_ok());
        assert!(validate_file_name("20210101T0000Z__ENTSOE_BD_001.xml").is_ok());
        assert!(validate_file_name("rsl.jar").is_ok());
        assert!(validate_file_name("a-b_c.d").is_ok());
    }

    #[test]
    fn test_validate_file_name_invalid() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name(".").is_err());
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("hello world.xml").is_err());
        assert!(validate_file_name("model;rm -rf /").is_err());
        assert!(validate_file_name("%2e%2e").is_err());
        assert!(validate_file_name("a\\b").is_err());
        assert!(validate_file_name("modèle.xml").is_err());
        assert!(validate_file_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_normalize_relative() {
        assert_eq!(
            normalize_relative("Root/config/rsl.jar").unwrap(),
            PathBuf::from("Root/config/rsl.jar")
        );
        assert_eq!(
            normalize_relative("./a/./b.xml").unwrap(),
            PathBuf::from("a/b.xml")
        );
    }

    #[test]
    fn test_normalize_relative_traversal_is_archive_error() {
        for bad in ["../../etc/passwd", "a/../../b", "/etc/passwd", ".."] {
            let err = normalize_relative(bad).unwrap_err();
            assert_eq!(err.kind(), "archive_error", "{}", bad);
        }
    }

    #[test]
    fn test_normalize_relative_bad_chars_is_sanitization_error() {
        let err = normalize_relative("dir/evil name.xml").unwrap_err();
        assert_eq!(err.kind(), "sanitization_error");

        // Encoded traversal never decodes; it fails the allow-list instead.
        let err = normalize_relative("%2e%2e/%2e%2e/etc/passwd").unwrap_err();
        assert_eq!(err.kind(), "sanitization_error");
    }

    #[test]
    fn test_normalize_relative_empty() {
        assert!(normalize_relative("").is_err());
        assert!(normalize_relative("./").is_err());
    }

    #[test]
    fn test_ensure_within() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("in")).unwrap();
        fs::write(root.join("in/a.xml"), "x").unwrap();
        fs::write(temp.path().join("outside.xml"), "x").unwrap();

        assert!(ensure_within(&root, &root.join("in/a.xml")).is_ok());
        assert!(ensure_within(&root, &root.join("in/../../outside.xml")).is_err());
        assert!(ensure_within(&root, &root).is_err());
        assert!(ensure_within(&root, &root.join("missing.xml")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_within_follows_symlinks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        fs::write(temp.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(temp.path().join("secret"), root.join("link")).unwrap();

        assert!(ensure_within(&root, &root.join("link")).is_err());
    }
}
