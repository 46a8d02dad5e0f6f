//! Secure zip handling for cgmesgate.
//!
//! All uploads that arrive as archives go through [`extract_zip`]:
//! - Symlinks and special files are BLOCKED
//! - Path traversal is validated on normalized components, then containment
//!   is re-checked on the canonical parent directory
//! - Entry and total sizes are enforced on the bytes actually decompressed
//! - Uses the Rust zip library (not subprocess) to prevent command injection
//!
//! Extraction is all-or-nothing: hostile archives are rejected before the
//! first byte is written, and any failure while writing rolls back what this
//! call created.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::sanitize::normalize_relative;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

/// Resource limits applied to a single extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveLimits {
    /// Largest decompressed size of one entry, in bytes.
    pub max_entry_bytes: u64,
    /// Largest decompressed size of the whole archive, in bytes.
    pub max_total_bytes: u64,
    /// Maximum number of entries (files and directories).
    pub max_entries: usize,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 2 * 1024 * 1024 * 1024,
            max_total_bytes: 5 * 1024 * 1024 * 1024,
            max_entries: 10_000,
        }
    }
}

/// How extracted files are laid out under the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractLayout {
    /// Keep the archive's directory structure (RSL bundles).
    Preserve,
    /// Write every file directly in the destination under its base name
    /// (model uploads). Directory entries are skipped.
    Flatten,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Special,
}

/// One member of an archive, as declared by the central directory.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveEntry {
    /// Path exactly as declared (may be hostile).
    pub declared_path: String,
    /// Declared uncompressed size. Never trusted for enforcement.
    pub declared_size: u64,
    pub kind: EntryKind,
}

/// Returns true when a declared upload name designates a zip archive.
pub fn is_zip_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".zip")
}

fn open_archive(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::Archive(format!("invalid zip file: {}", e)))
}

fn classify(file: &zip::read::ZipFile<'_>) -> EntryKind {
    if let Some(mode) = file.unix_mode() {
        match mode & S_IFMT {
            0 | S_IFREG => {}
            S_IFDIR => return EntryKind::Directory,
            S_IFLNK => return EntryKind::Symlink,
            _ => return EntryKind::Special,
        }
    }
    if file.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    }
}

/// List the entries of a zip archive without extracting anything.
pub fn inspect_zip(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive = open_archive(bytes)?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        entries.push(ArchiveEntry {
            declared_path: file.name().to_string(),
            declared_size: file.size(),
            kind: classify(&file),
        });
    }

    Ok(entries)
}

/// An entry that passed inspection, with its sanitized target.
struct PlannedEntry {
    index: usize,
    target: PathBuf,
    is_dir: bool,
}

fn plan_extraction(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    limits: &ArchiveLimits,
    layout: ExtractLayout,
) -> Result<Vec<PlannedEntry>> {
    if archive.len() > limits.max_entries {
        return Err(Error::Archive(format!(
            "too many entries: {} (max {})",
            archive.len(),
            limits.max_entries
        )));
    }

    let mut plan = Vec::with_capacity(archive.len());
    let mut targets = HashSet::new();
    let mut declared_total: u64 = 0;

    for index in 0..archive.len() {
        let file = archive.by_index(index)?;
        let declared = file.name().to_string();

        match classify(&file) {
            EntryKind::Symlink => {
                warn!("entry={} Rejected symlink entry", declared.escape_default());
                return Err(Error::Archive(format!(
                    "symlink entry not allowed: {}",
                    declared.escape_default()
                )));
            }
            EntryKind::Special => {
                warn!("entry={} Rejected special file entry", declared.escape_default());
                return Err(Error::Archive(format!(
                    "special file entry not allowed: {}",
                    declared.escape_default()
                )));
            }
            EntryKind::File | EntryKind::Directory => {}
        }

        let relative = normalize_relative(&declared)?;

        // The zip library's own containment check must agree with ours.
        if file.enclosed_name().is_none() {
            return Err(Error::Archive(format!(
                "unsafe entry path: {}",
                declared.escape_default()
            )));
        }

        if file.size() > limits.max_entry_bytes {
            return Err(Error::Archive(format!(
                "entry {} declares {} bytes (max {})",
                declared.escape_default(),
                file.size(),
                limits.max_entry_bytes
            )));
        }
        declared_total = declared_total.saturating_add(file.size());
        if declared_total > limits.max_total_bytes {
            return Err(Error::Archive(format!(
                "archive declares more than {} bytes uncompressed",
                limits.max_total_bytes
            )));
        }

        let is_dir = file.is_dir();
        let target = match (layout, is_dir) {
            (ExtractLayout::Flatten, true) => continue,
            (ExtractLayout::Flatten, false) => match relative.file_name() {
                Some(name) => PathBuf::from(name),
                None => continue,
            },
            (ExtractLayout::Preserve, _) => relative,
        };

        if !is_dir && !targets.insert(target.clone()) {
            return Err(Error::Archive(format!(
                "duplicate entry target: {}",
                target.display()
            )));
        }

        plan.push(PlannedEntry {
            index,
            target,
            is_dir,
        });
    }

    Ok(plan)
}

/// Tracks everything one extraction created so it can be rolled back.
struct Extraction {
    root: PathBuf,
    created: Vec<PathBuf>,
}

impl Extraction {
    fn create_dirs(&mut self, relative: &Path) -> Result<()> {
        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {
                    return Err(Error::Archive(format!(
                        "{} exists and is not a directory",
                        current.display()
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&current)?;
                    self.created.push(current.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn create_file(&mut self, relative: &Path) -> Result<(PathBuf, File)> {
        if let Some(parent) = relative.parent() {
            self.create_dirs(parent)?;
        }

        let target = self.root.join(relative);
        let parent = target
            .parent()
            .ok_or_else(|| Error::Archive(format!("no parent for {}", target.display())))?;

        // SECURITY: containment on the resolved parent, not the string.
        let resolved_parent = fs::canonicalize(parent)?;
        if !resolved_parent.starts_with(&self.root) {
            return Err(Error::Archive(format!(
                "{} resolves outside the destination",
                relative.display()
            )));
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => {
                    Error::Archive(format!("duplicate entry target: {}", relative.display()))
                }
                _ => Error::Io(e),
            })?;
        self.created.push(target.clone());
        Ok((target, file))
    }

    /// Remove everything this extraction created. Safe to call repeatedly.
    fn rollback(&mut self) {
        for path in self.created.drain(..).rev() {
            let result = match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => fs::remove_dir(&path),
                Ok(_) => fs::remove_file(&path),
                Err(_) => continue,
            };
            if let Err(e) = result {
                warn!("path={} error={} Failed to roll back extracted path", path.display(), e);
            }
        }
    }
}

/// Extract a zip archive held in memory into `destination`.
///
/// `destination` must be an existing directory owned by the caller (a
/// workspace). Returns the paths of the extracted regular files.
///
/// # Errors
/// [`Error::Archive`] for malformed or hostile archives and exceeded limits,
/// [`Error::Sanitization`] for names outside the allow-list. On error nothing
/// written by this call remains.
pub fn extract_zip(
    bytes: &[u8],
    destination: &Path,
    limits: &ArchiveLimits,
    layout: ExtractLayout,
) -> Result<Vec<PathBuf>> {
    let root = fs::canonicalize(destination)?;
    if !root.is_dir() {
        return Err(Error::Archive(format!(
            "destination is not a directory: {}",
            root.display()
        )));
    }

    let mut archive = open_archive(bytes)?;
    let plan = plan_extraction(&mut archive, limits, layout)?;

    let mut extraction = Extraction {
        root: root.clone(),
        created: Vec::new(),
    };

    match write_planned(&mut archive, &plan, limits, &mut extraction) {
        Ok(files) => {
            info!(
                "Extracted {} file(s) to {} ({} entries)",
                files.len(),
                root.display(),
                plan.len()
            );
            Ok(files)
        }
        Err(e) => {
            warn!("destination={} error={} Extraction aborted, rolling back", root.display(), e);
            extraction.rollback();
            Err(e)
        }
    }
}

fn write_planned(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    plan: &[PlannedEntry],
    limits: &ArchiveLimits,
    extraction: &mut Extraction,
) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut total: u64 = 0;

    for entry in plan {
        if entry.is_dir {
            extraction.create_dirs(&entry.target)?;
            continue;
        }

        let (path, mut out) = extraction.create_file(&entry.target)?;
        let zip_file = archive.by_index(entry.index)?;

        // Declared sizes are not trusted: count what actually decompresses.
        let allowed = limits
            .max_entry_bytes
            .min(limits.max_total_bytes.saturating_sub(total));
        let mut limited = zip_file.take(allowed.saturating_add(1));
        let written = io::copy(&mut limited, &mut out)?;

        if written > allowed {
            let which = if allowed < limits.max_entry_bytes {
                format!("total uncompressed size exceeds {} bytes", limits.max_total_bytes)
            } else {
                format!(
                    "entry {} exceeds {} bytes uncompressed",
                    entry.target.display(),
                    limits.max_entry_bytes
                )
            };
            return Err(Error::Archive(which));
        }

        total += written;
        out.flush()?;
        debug!("Extracted {} ({} bytes)", path.display(), written);
        files.push(path);
    }

    Ok(files)
}

/// Pack the contents of a directory into a zip file.
///
/// Symlinks are skipped. Entry names are relative to `source_dir`.
pub fn archive_directory(source_dir: &Path, archive_path: &Path) -> Result<usize> {
    let file = File::create(archive_path)?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut count = 0;
    append_dir(&mut zip, source_dir, source_dir, options, &mut count)?;
    zip.finish()?;

    debug!("Archived {} file(s) from {} to {}", count, source_dir.display(), archive_path.display());
    Ok(count)
}

fn append_dir(
    zip: &mut ZipWriter<File>,
    base: &Path,
    dir: &Path,
    options: FileOptions,
    count: &mut usize,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        let relative = path
            .strip_prefix(base)
            .map_err(|_| Error::Archive(format!("{} not under {}", path.display(), base.display())))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if meta.is_dir() {
            zip.add_directory(name, options)?;
            append_dir(zip, base, &path, options, count)?;
        } else if meta.is_file() {
            zip.start_file(name, options)?;
            let mut source = File::open(&path)?;
            io::copy(&mut source, zip)?;
            *count += 1;
        }
    }

    Ok(())
}

/// Build a zip in memory from `(name, contents)` pairs.
///
/// Used by tests and by callers that assemble small bundles.
pub fn zip_from_entries<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, contents) in entries {
        if name.ends_with('/') {
            zip.add_directory(name, options)?;
        } else {
            zip.start_file(name, options)?;
            zip.write_all(contents)?;
        }
    }

    Ok(zip.finish()?.into_inner())
}
