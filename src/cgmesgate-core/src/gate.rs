//! Validation gates and the engine/converter command lines.
//!
//! SECURITY: commands are argv vectors handed straight to `execve`. No shell
//! is involved, and user-controlled values (file names, gate) are never
//! quoted or concatenated into a single string.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::readiness::RslBundle;
use crate::sanitize::validate_file_name;
use crate::workspace::Workspace;

/// Marker carried by CGMES boundary set file names.
pub const BOUNDARY_MARKER: &str = "BD_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationGate {
    Full,
    FullIgm,
    FullCgm,
    Bds,
}

impl ValidationGate {
    pub const ALL: [ValidationGate; 4] = [
        ValidationGate::Full,
        ValidationGate::FullIgm,
        ValidationGate::FullCgm,
        ValidationGate::Bds,
    ];

    /// Wire name, also the engine's `-vg` argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationGate::Full => "full",
            ValidationGate::FullIgm => "full_igm",
            ValidationGate::FullCgm => "full_cgm",
            ValidationGate::Bds => "bds",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ValidationGate::Full => "Full",
            ValidationGate::FullIgm => "Full IGM",
            ValidationGate::FullCgm => "Full CGM",
            ValidationGate::Bds => "BDS",
        }
    }

    /// Minimum (boundary files, model files) this gate needs.
    pub fn minimum_inputs(&self) -> (usize, usize) {
        match self {
            ValidationGate::Bds => (1, 0),
            ValidationGate::Full | ValidationGate::FullIgm => (1, 1),
            ValidationGate::FullCgm => (1, 2),
        }
    }
}

impl fmt::Display for ValidationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationGate {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ValidationGate::ALL
            .into_iter()
            .find(|g| g.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown validation gate '{}' (expected one of: full, full_igm, full_cgm, bds)",
                    s.escape_default()
                )
            })
    }
}

pub fn is_boundary_file(name: &str) -> bool {
    name.contains(BOUNDARY_MARKER)
}

/// A fully-resolved external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

impl ProcessInvocation {
    /// Human-readable rendering for logs. Never executed.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Builds engine and converter invocations for one job workspace.
pub struct GateCommandBuilder<'a> {
    launcher: &'a Path,
    bundle: &'a RslBundle,
    workspace: &'a Workspace,
}

impl<'a> GateCommandBuilder<'a> {
    pub fn new(launcher: &'a Path, bundle: &'a RslBundle, workspace: &'a Workspace) -> Self {
        Self {
            launcher,
            bundle,
            workspace,
        }
    }

    /// `<java> -jar <bundle>/config/rsl.jar -i <ws>/in -o <ws>/out -vg <gate> -c <bundle>/config`
    ///
    /// Every input must be a regular file directly inside the workspace
    /// `in/`, and the set must satisfy the gate's minimums.
    pub fn build(&self, gate: ValidationGate, inputs: &[PathBuf]) -> Result<ProcessInvocation> {
        let invalid = |reason: String| Error::InvalidGateInput { gate, reason };

        if !self.launcher.is_absolute() {
            return Err(invalid(format!(
                "launcher must be an absolute path: {}",
                self.launcher.display()
            )));
        }

        let in_dir = fs::canonicalize(self.workspace.in_dir())
            .map_err(|e| invalid(format!("workspace input directory unavailable: {}", e)))?;

        let mut seen = HashSet::new();
        let (mut boundaries, mut models) = (0usize, 0usize);

        for input in inputs {
            let name = input
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| invalid(format!("input has no file name: {}", input.display())))?;
            validate_file_name(name).map_err(|e| invalid(e.to_string()))?;

            let resolved = fs::canonicalize(input)
                .map_err(|_| invalid(format!("input not found: {}", name)))?;
            if resolved.parent() != Some(in_dir.as_path()) {
                return Err(invalid(format!("input outside the workspace: {}", name)));
            }
            if !fs::symlink_metadata(&resolved).map(|m| m.is_file()).unwrap_or(false) {
                return Err(invalid(format!("input is not a regular file: {}", name)));
            }

            if !seen.insert(resolved) {
                continue;
            }
            if is_boundary_file(name) {
                boundaries += 1;
            } else {
                models += 1;
            }
        }

        let (min_boundaries, min_models) = gate.minimum_inputs();
        if boundaries < min_boundaries {
            return Err(invalid(format!(
                "requires at least {} boundary file(s) (name containing '{}'), got {}",
                min_boundaries, BOUNDARY_MARKER, boundaries
            )));
        }
        if models < min_models {
            return Err(invalid(format!(
                "requires at least {} model file(s), got {}",
                min_models, models
            )));
        }

        let invocation = ProcessInvocation {
            program: self.launcher.to_path_buf(),
            args: vec![
                "-jar".into(),
                self.bundle.engine_jar().into_os_string(),
                "-i".into(),
                in_dir.into_os_string(),
                "-o".into(),
                self.workspace.out_dir().into_os_string(),
                "-vg".into(),
                gate.as_str().into(),
                "-c".into(),
                self.bundle.config_dir().into_os_string(),
            ],
            working_dir: self.workspace.root().to_path_buf(),
        };

        debug!(
            "gate={} boundaries={} models={} Built engine command: {}",
            gate,
            boundaries,
            models,
            invocation.describe()
        );
        Ok(invocation)
    }

    /// `<java> -jar <bundle>/config/qar2xlsx.jar <ws>/out`
    pub fn converter(&self) -> Result<ProcessInvocation> {
        if !self.launcher.is_absolute() {
            return Err(Error::Conversion(format!(
                "launcher must be an absolute path: {}",
                self.launcher.display()
            )));
        }

        Ok(ProcessInvocation {
            program: self.launcher.to_path_buf(),
            args: vec![
                "-jar".into(),
                self.bundle.converter_jar().into_os_string(),
                self.workspace.out_dir().into_os_string(),
            ],
            working_dir: self.workspace.root().to_path_buf(),
        })
    }
}
