//! Uploaded artifacts and their ingestion into a job workspace.
//!
//! Model files arrive either one by one or bundled in a `.zip`. Zips are
//! flattened into `in/` through the archive sanitizer; plain files are
//! written under their (allow-listed) name.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, info};

use crate::archive::{self, ArchiveLimits, ExtractLayout};
use crate::error::{Error, Result};
use crate::sanitize::validate_file_name;

/// Raw bytes plus the declared file name. Only lives while being sanitized.
#[derive(Debug, Clone)]
pub struct UploadedArchive {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedArchive {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    /// Read an upload from local disk (operator tooling).
    pub fn from_path(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Sanitization(format!("no usable file name in {}", path.display())))?;
        Ok(Self::new(filename, fs::read(path)?))
    }

    /// Decode a `data:<mime>;base64,<payload>` upload.
    pub fn from_data_url(filename: impl Into<String>, data_url: &str) -> Result<Self> {
        let (header, payload) = data_url
            .split_once(',')
            .ok_or_else(|| Error::Sanitization("data URL has no payload".to_string()))?;

        if !header.starts_with("data:") || !header.ends_with(";base64") {
            return Err(Error::Sanitization(format!(
                "unsupported data URL header: {}",
                header.escape_default()
            )));
        }

        let bytes = STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Sanitization(format!("invalid base64 payload: {}", e)))?;
        Ok(Self::new(filename, bytes))
    }

    pub fn is_zip(&self) -> bool {
        archive::is_zip_name(&self.filename)
    }
}

/// A grid-model upload: one model/boundary file or a zip of them.
pub type ModelUpload = UploadedArchive;

/// Write uploads into `in_dir`. Returns the paths of all materialized files.
///
/// `limits.max_total_bytes` bounds everything written for the request: each
/// zip is extracted against what the previous uploads left over.
///
/// On error the caller discards the whole workspace; nothing here is reused.
pub fn ingest_uploads(
    uploads: &[ModelUpload],
    in_dir: &Path,
    limits: &ArchiveLimits,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut written: u64 = 0;

    for upload in uploads {
        validate_file_name(&upload.filename)?;
        let remaining = limits.max_total_bytes.saturating_sub(written);

        if upload.is_zip() {
            let bounded = ArchiveLimits {
                max_total_bytes: remaining,
                ..*limits
            };
            let extracted =
                archive::extract_zip(&upload.bytes, in_dir, &bounded, ExtractLayout::Flatten)?;
            for path in &extracted {
                written = written.saturating_add(fs::metadata(path)?.len());
            }
            debug!("upload={} Flattened {} file(s)", upload.filename, extracted.len());
            files.extend(extracted);
        } else {
            let size = upload.bytes.len() as u64;
            if size > limits.max_entry_bytes {
                return Err(Error::Archive(format!(
                    "upload {} exceeds {} bytes",
                    upload.filename, limits.max_entry_bytes
                )));
            }
            if size > remaining {
                return Err(Error::Archive(format!(
                    "uploads exceed {} bytes in total",
                    limits.max_total_bytes
                )));
            }
            files.push(write_new(in_dir, &upload.filename, &upload.bytes)?);
            written += size;
        }
    }

    info!("Ingested {} input file(s) from {} upload(s)", files.len(), uploads.len());
    Ok(files)
}

fn write_new(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => Error::Archive(format!("duplicate input file: {}", name)),
            _ => Error::Io(e),
        })?;
    file.write_all(bytes)?;
    Ok(path)
}
