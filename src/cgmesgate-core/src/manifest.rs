//! RSL manifest (`config/config.xml`) reader.
//!
//! SECURITY: the manifest comes from an uploaded archive. It is parsed with a
//! pull parser that never fetches or expands external entities, and any
//! document carrying a DOCTYPE declaration is rejected outright, so XXE and
//! entity-expansion payloads fail before any entity could be defined.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Result};

/// Manifests larger than this are not parsed.
pub const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

const VERSION_ELEMENT: &[u8] = b"rslVersion";

/// Read the rule-set version from a manifest file.
///
/// Returns `Ok(None)` when the file has no `rslVersion` element.
pub fn read_rsl_version(path: &Path) -> Result<Option<String>> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_file() {
        return Err(Error::Archive(format!(
            "manifest is not a regular file: {}",
            path.display()
        )));
    }
    if meta.len() > MAX_MANIFEST_BYTES {
        return Err(Error::Archive(format!(
            "manifest too large: {} bytes (max {})",
            meta.len(),
            MAX_MANIFEST_BYTES
        )));
    }

    let xml = fs::read_to_string(path)
        .map_err(|e| Error::Archive(format!("manifest is not UTF-8 text: {}", e)))?;
    let version = parse_rsl_version(&xml)?;
    debug!("manifest={} version={:?} Read RSL manifest", path.display(), version);
    Ok(version)
}

/// Extract the first non-empty `rslVersion` element (any namespace prefix).
pub fn parse_rsl_version(xml: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut depth_in_version = 0usize;
    let mut version = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                warn!("Rejected RSL manifest with DOCTYPE declaration");
                return Err(Error::Archive(
                    "manifest contains a DOCTYPE declaration".to_string(),
                ));
            }
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == VERSION_ELEMENT {
                    depth_in_version += 1;
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == VERSION_ELEMENT && depth_in_version > 0 {
                    depth_in_version -= 1;
                    let trimmed = version.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_string()));
                    }
                    version.clear();
                }
            }
            Ok(Event::Text(t)) if depth_in_version > 0 => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::Archive(format!("invalid manifest text: {}", e)))?;
                version.push_str(&text);
            }
            Ok(Event::CData(t)) if depth_in_version > 0 => {
                version.push_str(&String::from_utf8_lossy(&t));
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => {
                return Err(Error::Archive(format!(
                    "malformed manifest at byte {}: {}",
                    reader.buffer_position(),
                    e
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_plain_version() {
        let v = parse_rsl_version("<rslVersion>1.0</rslVersion>").unwrap();
        assert_eq!(v.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_namespaced_version() {
        let xml = r#"<?xml version="1.0"?>
<rsl><entsoe:rslVersion xmlns:entsoe="http://entsoe.eu/CIM/Extensions/CGM-BP/2020#">
  TEST-1.0
</entsoe:rslVersion></rsl>"#;
        let v = parse_rsl_version(xml).unwrap();
        assert_eq!(v.as_deref(), Some("TEST-1.0"));
    }

    #[test]
    fn test_missing_version() {
        let v = parse_rsl_version("<config><rules/></config>").unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn test_doctype_rejected() {
        let xxe = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<rslVersion>&xxe;</rslVersion>"#;
        let err = parse_rsl_version(xxe).unwrap_err();
        assert_eq!(err.kind(), "archive_error");
        assert!(err.to_string().contains("DOCTYPE"));
    }

    #[test]
    fn test_billion_laughs_rejected() {
        let bomb = r#"<!DOCTYPE lolz [<!ENTITY lol "lol"><!ENTITY lol2 "&lol;&lol;">]>
<rslVersion>&lol2;</rslVersion>"#;
        assert!(parse_rsl_version(bomb).is_err());
    }

    #[test]
    fn test_undefined_entity_rejected() {
        assert!(parse_rsl_version("<rslVersion>&xxe;</rslVersion>").is_err());
    }

    #[test]
    fn test_malformed_rejected() {
        assert!(parse_rsl_version("<rslVersion>1.0</other>").is_err());
    }

    #[test]
    fn test_read_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.xml");
        fs::write(&path, "<Root><rslVersion>2.1.3</rslVersion></Root>").unwrap();

        assert_eq!(read_rsl_version(&path).unwrap().as_deref(), Some("2.1.3"));
    }

    #[test]
    fn test_oversized_file_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.xml");
        let padding = " ".repeat(MAX_MANIFEST_BYTES as usize + 1);
        fs::write(&path, format!("<Root>{}</Root>", padding)).unwrap();

        assert!(read_rsl_version(&path).is_err());
    }
}
