//! Readiness state machine for RSL installation.
//!
//! Validation is gated on a trusted Rule Set Library bundle:
//!
//! ```text
//! NotReady ──install──▶ Installing ──ok──▶ Ready
//!    ▲                      │  ▲              │
//!    └──────fail────────────┘  └──re-upload───┘
//!                           │
//!                           └─fail, prior bundle broken─▶ Degraded
//! ```
//!
//! The active bundle is shared as `Arc<RslBundle>`; the write lock is only
//! held to swap the pointer. A replaced bundle is retired and its directory
//! removed when the last running job drops its reference.
//!
//! Layout under the RSL root:
//! ```text
//! <data>/rsl/
//! ├── active.json      # durable marker (temp file + rename)
//! └── <uuid>/          # one promoted bootstrap workspace per bundle
//!     └── [wrapper/]config/{rsl.jar,qar2xlsx.jar,config.xml}
//! ```

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::archive::{self, ArchiveLimits, ExtractLayout};
use crate::error::{Error, Result};
use crate::manifest;
use crate::sanitize::validate_file_name;
use crate::upload::UploadedArchive;
use crate::workspace::{remove_tree, Workspace, WorkspaceManager};

pub const ENGINE_JAR: &str = "rsl.jar";
pub const CONVERTER_JAR: &str = "qar2xlsx.jar";
pub const CONFIG_DIR: &str = "config";
pub const MANIFEST_FILE: &str = "config.xml";
const MARKER_FILE: &str = "active.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    NotReady,
    Installing,
    Ready,
    Degraded,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadinessState::NotReady => "not_ready",
            ReadinessState::Installing => "installing",
            ReadinessState::Ready => "ready",
            ReadinessState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// An installed, verified RSL bundle.
#[derive(Debug)]
pub struct RslBundle {
    /// Promoted workspace owning the bundle files.
    workspace_dir: PathBuf,
    /// Directory containing `config/` (the workspace or its wrapper folder).
    root: PathBuf,
    version: Option<String>,
    engine_sha256: String,
    converter_sha256: String,
    installed_at: DateTime<Utc>,
    retired: AtomicBool,
}

impl RslBundle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    pub fn engine_jar(&self) -> PathBuf {
        self.config_dir().join(ENGINE_JAR)
    }

    pub fn converter_jar(&self) -> PathBuf {
        self.config_dir().join(CONVERTER_JAR)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn engine_sha256(&self) -> &str {
        &self.engine_sha256
    }

    pub fn converter_sha256(&self) -> &str {
        &self.converter_sha256
    }

    pub fn installed_at(&self) -> DateTime<Utc> {
        self.installed_at
    }

    /// Re-check both artifacts against the recorded checksums.
    pub fn verify(&self) -> Result<()> {
        for (path, expected) in [
            (self.engine_jar(), &self.engine_sha256),
            (self.converter_jar(), &self.converter_sha256),
        ] {
            check_artifact(&path)?;
            let actual = sha256_file(&path)?;
            if &actual != expected {
                return Err(Error::Archive(format!(
                    "checksum mismatch for {} (expected {}, found {})",
                    path.display(),
                    expected,
                    actual
                )));
            }
        }
        Ok(())
    }

    /// Mark for removal once the last reference is dropped.
    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }
}

impl Drop for RslBundle {
    fn drop(&mut self) {
        if self.retired.load(Ordering::SeqCst) {
            match remove_tree(&self.workspace_dir) {
                Ok(()) => info!("bundle={} Removed retired RSL bundle", self.workspace_dir.display()),
                Err(e) => warn!(
                    "bundle={} error={} Failed to remove retired RSL bundle",
                    self.workspace_dir.display(),
                    e
                ),
            }
        }
    }
}

/// Durable record of the active bundle, `<rsl root>/active.json`.
#[derive(Debug, Serialize, Deserialize)]
struct ActiveMarker {
    /// Workspace directory name (a UUID) under the RSL root.
    workspace: String,
    /// Optional single wrapper directory inside the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wrapper: Option<String>,
    version: Option<String>,
    engine_sha256: String,
    converter_sha256: String,
    installed_at: DateTime<Utc>,
}

struct Inner {
    state: ReadinessState,
    bundle: Option<Arc<RslBundle>>,
}

/// Process-wide readiness with an explicit lifecycle.
pub struct Readiness {
    workspaces: WorkspaceManager,
    limits: ArchiveLimits,
    inner: RwLock<Inner>,
    install_lock: Mutex<()>,
}

impl Readiness {
    /// Open the RSL root and restore state from the durable marker.
    ///
    /// No marker means NotReady. A marker whose bundle is missing, empty or
    /// altered means Degraded. Bootstrap leftovers are swept.
    /// The caller must own the data directory (see [`crate::lock`]).
    pub fn open(rsl_root: impl Into<PathBuf>, limits: ArchiveLimits) -> Result<Self> {
        let workspaces = WorkspaceManager::new(rsl_root)?;
        let marker_path = workspaces.base().join(MARKER_FILE);

        let (state, bundle) = match load_marker(&marker_path) {
            Ok(None) => (ReadinessState::NotReady, None),
            Ok(Some(marker)) => match bundle_from_marker(workspaces.base(), marker) {
                Ok(bundle) => match bundle.verify() {
                    Ok(()) => (ReadinessState::Ready, Some(Arc::new(bundle))),
                    Err(e) => {
                        warn!("error={} Installed RSL bundle failed verification", e);
                        (ReadinessState::Degraded, Some(Arc::new(bundle)))
                    }
                },
                Err(e) => {
                    warn!("error={} RSL marker points to an invalid bundle", e);
                    (ReadinessState::Degraded, None)
                }
            },
            Err(e) => {
                warn!("marker={} error={} Unreadable RSL marker", marker_path.display(), e);
                (ReadinessState::Degraded, None)
            }
        };

        let keep: Vec<&Path> = bundle
            .as_ref()
            .map(|b| vec![b.workspace_dir.as_path()])
            .unwrap_or_default();
        workspaces.sweep_stale(&keep)?;

        info!(
            "state={} version={} Readiness restored",
            state,
            bundle.as_ref().and_then(|b| b.version()).unwrap_or("-")
        );

        Ok(Self {
            workspaces,
            limits,
            inner: RwLock::new(Inner { state, bundle }),
            install_lock: Mutex::new(()),
        })
    }

    pub fn current_state(&self) -> ReadinessState {
        self.read().state
    }

    /// The active bundle, only while Ready.
    pub fn active_bundle(&self) -> Result<Arc<RslBundle>> {
        let inner = self.read();
        match (&inner.state, &inner.bundle) {
            (ReadinessState::Ready, Some(bundle)) => Ok(Arc::clone(bundle)),
            (state, _) => Err(Error::SystemNotReady(*state)),
        }
    }

    /// Version of the installed bundle (Ready or Degraded), if it has one.
    pub fn version(&self) -> Option<String> {
        self.read()
            .bundle
            .as_ref()
            .and_then(|b| b.version().map(str::to_string))
    }

    /// Validate and install an uploaded RSL bundle.
    ///
    /// # Errors
    /// [`Error::InstallInProgress`] when another install holds the lock.
    /// Archive and sanitization errors for a bad bundle; the prior state is
    /// then restored (Ready degrades only if its bundle no longer verifies).
    pub fn install_rsl(&self, upload: &UploadedArchive) -> Result<Arc<RslBundle>> {
        let _guard = match self.install_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(Error::InstallInProgress),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        let prior = {
            let mut inner = self.write();
            let prior = inner.state;
            inner.state = ReadinessState::Installing;
            prior
        };
        info!("file={} prior={} Installing RSL bundle", upload.filename.escape_default(), prior);

        let staged = self
            .stage_bundle(upload)
            .and_then(|bundle| self.write_marker(&bundle).map(|()| bundle));

        match staged {
            Ok(bundle) => {
                let bundle = Arc::new(bundle);
                let old = {
                    let mut inner = self.write();
                    inner.state = ReadinessState::Ready;
                    inner.bundle.replace(Arc::clone(&bundle))
                };
                if let Some(old) = old {
                    old.retire();
                }
                info!(
                    "state=ready version={} engine_sha256={} RSL bundle installed",
                    bundle.version().unwrap_or("-"),
                    bundle.engine_sha256()
                );
                Ok(bundle)
            }
            Err(e) => {
                // Hash outside the lock; jobs keep reading the old bundle meanwhile.
                let current = self.read().bundle.clone();
                let restored = match (prior, current) {
                    (ReadinessState::Ready, Some(b)) if b.verify().is_err() => {
                        error!("Previous RSL bundle no longer verifies, readiness degraded");
                        ReadinessState::Degraded
                    }
                    _ => prior,
                };
                self.write().state = restored;
                warn!("state={} error={} RSL installation failed", restored, e);
                Err(e)
            }
        }
    }

    fn stage_bundle(&self, upload: &UploadedArchive) -> Result<RslBundle> {
        validate_file_name(&upload.filename)?;
        if !archive::is_zip_name(&upload.filename) {
            return Err(Error::Archive(format!(
                "RSL upload must be a .zip file: {}",
                upload.filename
            )));
        }

        let workspace = self.workspaces.create_bootstrap()?;
        archive::extract_zip(&upload.bytes, workspace.root(), &self.limits, ExtractLayout::Preserve)?;

        let wrapper = locate_wrapper(&workspace)?;
        let root = match &wrapper {
            Some(name) => workspace.root().join(name),
            None => workspace.root().to_path_buf(),
        };

        let config_dir = root.join(CONFIG_DIR);
        let engine_jar = config_dir.join(ENGINE_JAR);
        let converter_jar = config_dir.join(CONVERTER_JAR);
        check_artifact(&engine_jar)?;
        check_artifact(&converter_jar)?;

        let manifest_path = config_dir.join(MANIFEST_FILE);
        let version = match fs::symlink_metadata(&manifest_path) {
            Ok(_) => manifest::read_rsl_version(&manifest_path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let engine_sha256 = sha256_file(&engine_jar)?;
        let converter_sha256 = sha256_file(&converter_jar)?;

        let workspace_dir = workspace.keep();
        let root = match &wrapper {
            Some(name) => workspace_dir.join(name),
            None => workspace_dir.clone(),
        };

        Ok(RslBundle {
            workspace_dir,
            root,
            version,
            engine_sha256,
            converter_sha256,
            installed_at: Utc::now(),
            retired: AtomicBool::new(false),
        })
    }

    fn write_marker(&self, bundle: &RslBundle) -> Result<()> {
        let result = (|| -> Result<()> {
            let workspace = dir_name(&bundle.workspace_dir)?;
            let wrapper = if bundle.root == bundle.workspace_dir {
                None
            } else {
                Some(dir_name(&bundle.root)?)
            };
            let marker = ActiveMarker {
                workspace,
                wrapper,
                version: bundle.version.clone(),
                engine_sha256: bundle.engine_sha256.clone(),
                converter_sha256: bundle.converter_sha256.clone(),
                installed_at: bundle.installed_at,
            };

            let json = serde_json::to_vec_pretty(&marker)
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            let final_path = self.workspaces.base().join(MARKER_FILE);
            let temp_path = self.workspaces.base().join(format!("{}.tmp", MARKER_FILE));

            let mut file = File::create(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&temp_path, &final_path)?;
            debug!("Wrote RSL marker {}", final_path.display());
            Ok(())
        })();

        if result.is_err() {
            // The staged bundle never becomes active: remove it on drop.
            bundle.retire();
        }
        result
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Find the directory holding `config/`: the workspace itself, or its single
/// top-level wrapper directory.
fn locate_wrapper(workspace: &Workspace) -> Result<Option<String>> {
    if workspace.root().join(CONFIG_DIR).is_dir() {
        return Ok(None);
    }

    let entries: Vec<_> = fs::read_dir(workspace.root())?.collect::<io::Result<_>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() && only.path().join(CONFIG_DIR).is_dir() {
            return Ok(Some(only.file_name().to_string_lossy().into_owned()));
        }
    }

    Err(Error::Archive(format!(
        "RSL bundle must contain {dir}/{ENGINE_JAR} and {dir}/{CONVERTER_JAR}",
        dir = CONFIG_DIR
    )))
}

/// An artifact must be a non-empty regular file (not followed if a symlink).
fn check_artifact(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(meta) if meta.is_file() => Err(Error::Archive(format!(
            "required artifact is empty: {}",
            path.display()
        ))),
        Ok(_) => Err(Error::Archive(format!(
            "required artifact is not a regular file: {}",
            path.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Archive(format!(
            "required artifact missing: {}",
            path.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn dir_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::Archive(format!("no directory name in {}", path.display())))
}

fn load_marker(path: &Path) -> Result<Option<ActiveMarker>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::Archive(format!("invalid marker {}: {}", path.display(), e)))
}

/// Rebuild a bundle from the marker. The marker is re-validated, not trusted.
fn bundle_from_marker(base: &Path, marker: ActiveMarker) -> Result<RslBundle> {
    Uuid::parse_str(&marker.workspace)
        .map_err(|_| Error::Archive(format!("invalid bundle workspace: {}", marker.workspace)))?;
    let workspace_dir = base.join(&marker.workspace);

    let root = match &marker.wrapper {
        Some(name) => {
            validate_file_name(name)?;
            workspace_dir.join(name)
        }
        None => workspace_dir.clone(),
    };

    Ok(RslBundle {
        workspace_dir,
        root,
        version: marker.version,
        engine_sha256: marker.engine_sha256,
        converter_sha256: marker.converter_sha256,
        installed_at: marker.installed_at,
        retired: AtomicBool::new(false),
    })
}
