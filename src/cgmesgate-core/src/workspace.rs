//! Workspace management for cgmesgate.
//!
//! Every job and every RSL bootstrap gets its own exclusively-owned
//! directory, named by a fresh UUID v4:
//! - `in/` - Sanitized inputs (engine reads here)
//! - `out/` - Engine and converter outputs
//! - `tmp/` - Scratch space, exported as `TMPDIR`
//!
//! Bootstrap workspaces are bare directories. A [`Workspace`] removes itself
//! when dropped unless it was promoted with [`Workspace::keep`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use uuid::Uuid;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::{Error, Result};

/// Allocates workspaces below one base directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    /// Open (and create if needed) a base directory for workspaces.
    ///
    /// SECURITY: the base is restricted to the service user (mode 0700).
    pub fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|e| Error::workspace(&base, e))?;

        #[cfg(unix)]
        {
            let mut permissions = fs::metadata(&base)
                .map_err(|e| Error::workspace(&base, e))?
                .permissions();
            if permissions.mode() & 0o777 != 0o700 {
                debug!("Setting mode 0700 on {}", base.display());
                permissions.set_mode(0o700);
                fs::set_permissions(&base, permissions).map_err(|e| Error::workspace(&base, e))?;
            }
        }

        let base = fs::canonicalize(&base).map_err(|e| Error::workspace(&base, e))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create a job workspace with `in/`, `out/` and `tmp/`.
    pub fn create_job(&self) -> Result<Workspace> {
        let mut workspace = self.create_bare()?;
        for dir in [workspace.in_dir(), workspace.out_dir(), workspace.tmp_dir()] {
            if let Err(e) = fs::create_dir(&dir) {
                let err = Error::workspace(&dir, e);
                workspace.cleanup()?;
                return Err(err);
            }
        }

        info!("workspace={} Created job workspace (in, out, tmp)", workspace.id);
        Ok(workspace)
    }

    /// Create a bare workspace for an RSL bootstrap.
    pub fn create_bootstrap(&self) -> Result<Workspace> {
        let workspace = self.create_bare()?;
        info!("workspace={} Created bootstrap workspace", workspace.id);
        Ok(workspace)
    }

    fn create_bare(&self) -> Result<Workspace> {
        let id = Uuid::new_v4();
        let root = self.base.join(id.to_string());

        // Exclusive create: an existing directory is never reused.
        fs::create_dir(&root).map_err(|e| Error::workspace(&root, e))?;

        Ok(Workspace {
            id,
            root,
            released: false,
        })
    }

    /// Remove every workspace directory below the base except `keep`.
    ///
    /// Used at startup: in-flight jobs and half-finished bootstraps do not
    /// survive a restart. Plain files in the base are left alone.
    pub fn sweep_stale(&self, keep: &[&Path]) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.base).map_err(|e| Error::workspace(&self.base, e))? {
            let entry = entry.map_err(|e| Error::workspace(&self.base, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| Error::workspace(&path, e))?;

            if !file_type.is_dir() || keep.iter().any(|k| *k == path.as_path()) {
                continue;
            }
            if entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()).is_none() {
                debug!("Not sweeping foreign directory {}", path.display());
                continue;
            }

            remove_tree(&path)?;
            removed += 1;
        }

        if removed > 0 {
            info!("base={} Swept {} stale workspace(s)", self.base.display(), removed);
        }
        Ok(removed)
    }
}

/// An exclusively-owned workspace directory.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    root: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn in_dir(&self) -> PathBuf {
        self.root.join("in")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join("out")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Recursively remove the workspace. Calling it again is a no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        remove_tree(&self.root)?;
        self.released = true;
        debug!("workspace={} Cleaned up {}", self.id, self.root.display());
        Ok(())
    }

    /// Disarm the drop guard and hand the directory over to the caller.
    pub fn keep(mut self) -> PathBuf {
        self.released = true;
        std::mem::take(&mut self.root)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("workspace={} error={} Failed to remove workspace", self.id, e);
        }
    }
}

/// `remove_dir_all` that treats a missing directory as already removed.
pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::workspace(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_job_workspace_layout() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("jobs")).unwrap();
        let workspace = manager.create_job().unwrap();

        assert!(workspace.in_dir().is_dir());
        assert!(workspace.out_dir().is_dir());
        assert!(workspace.tmp_dir().is_dir());
        assert!(workspace.root().starts_with(manager.base()));
        assert_eq!(
            workspace.root().file_name().unwrap().to_str().unwrap(),
            workspace.id().to_string()
        );
    }

    #[test]
    fn test_workspaces_are_unique() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let a = manager.create_job().unwrap();
        let b = manager.create_job().unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[cfg(unix)]
    #[test]
    fn test_base_mode() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("jobs")).unwrap();
        let mode = fs::metadata(manager.base()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_drop_removes_workspace() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let workspace = manager.create_job().unwrap();
        let root = workspace.root().to_path_buf();
        fs::write(workspace.out_dir().join("qar.xml"), "x").unwrap();

        drop(workspace);
        assert!(!root.exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let mut workspace = manager.create_job().unwrap();

        workspace.cleanup().unwrap();
        workspace.cleanup().unwrap();
        assert!(!workspace.root().exists());
    }

    #[test]
    fn test_cleanup_after_external_removal() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let mut workspace = manager.create_job().unwrap();

        fs::remove_dir_all(workspace.root()).unwrap();
        assert!(workspace.cleanup().is_ok());
    }

    #[test]
    fn test_keep_promotes() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let workspace = manager.create_bootstrap().unwrap();

        let root = workspace.keep();
        assert!(root.is_dir());
    }

    #[test]
    fn test_sweep_stale() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let kept = manager.create_bootstrap().unwrap().keep();
        let stale = manager.create_job().unwrap().keep();
        fs::write(manager.base().join("active.json"), "{}").unwrap();
        fs::create_dir(manager.base().join("not-a-workspace")).unwrap();

        let removed = manager.sweep_stale(&[kept.as_path()]).unwrap();

        assert_eq!(removed, 1);
        assert!(kept.exists());
        assert!(!stale.exists());
        assert!(manager.base().join("active.json").exists());
        assert!(manager.base().join("not-a-workspace").exists());
    }

    #[test]
    fn test_workspace_panic_cleanup() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path()).unwrap();
        let workspace = manager.create_job().unwrap();
        let root = workspace.root().to_path_buf();

        let result = std::panic::catch_unwind(move || {
            let _guard = workspace;
            panic!("worker failed");
        });

        assert!(result.is_err());
        assert!(!root.exists());
    }
}
