//! Validation job records.
//!
//! A job moves `Queued → Running → {Succeeded, Failed, TimedOut}`. Terminal
//! states are final; a retry is a new job. Every transition is mirrored to
//! `<data>/results/<job>/status.json` so operators and pollers can follow a
//! job without access to the service's memory.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gate::ValidationGate;

pub const STATUS_FILE: &str = "status.json";

// ============================================================================
// Identity and state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| format!("invalid job id '{}'", s.escape_default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }

    fn can_become(&self, next: JobState) -> bool {
        match self {
            JobState::Queued => matches!(next, JobState::Running | JobState::Failed),
            JobState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Stable error kind, see [`Error::kind`].
    pub kind: String,
    pub message: String,
}

impl From<&Error> for JobFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Job record
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationJob {
    pub id: JobId,
    pub gate: ValidationGate,
    /// Sanitized input file names.
    pub inputs: Vec<String>,
    pub state: JobState,
    /// RSL version the job was built against.
    #[serde(default)]
    pub rsl_version: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    /// Converted report (`report.xlsx`) in durable storage.
    #[serde(default)]
    pub report: Option<PathBuf>,
    /// Zip of the engine output directory in durable storage.
    #[serde(default)]
    pub results_archive: Option<PathBuf>,
}

impl ValidationJob {
    pub fn new(id: JobId, gate: ValidationGate, inputs: Vec<String>, rsl_version: Option<String>) -> Self {
        Self {
            id,
            gate,
            inputs,
            state: JobState::Queued,
            rsl_version,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            failure: None,
            report: None,
            results_archive: None,
        }
    }

    /// Queued → Running. Returns false if the job was not queued.
    pub fn start(&mut self) -> bool {
        if !self.transition(JobState::Running) {
            return false;
        }
        self.started_at = Some(Utc::now());
        true
    }

    pub fn succeed(&mut self) -> bool {
        self.finish(JobState::Succeeded, None)
    }

    pub fn fail(&mut self, err: &Error) -> bool {
        let state = match err {
            Error::Timeout(_) => JobState::TimedOut,
            _ => JobState::Failed,
        };
        self.finish(state, Some(JobFailure::from(err)))
    }

    fn finish(&mut self, state: JobState, failure: Option<JobFailure>) -> bool {
        if !self.transition(state) {
            return false;
        }
        self.failure = failure;
        self.finished_at = Some(Utc::now());
        true
    }

    fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_become(next) {
            warn!("job={} from={} to={} Ignored invalid job transition", self.id, self.state, next);
            return false;
        }
        debug!("job={} from={} to={} Job transition", self.id, self.state, next);
        self.state = next;
        true
    }

    /// Atomically rewrite `status.json` in `dir` (temp file + rename).
    pub fn write_status(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| Error::workspace(dir, e))?;

        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        let path = dir.join(STATUS_FILE);
        let temp = dir.join(format!("{}.tmp", STATUS_FILE));

        let mut file = File::create(&temp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp, &path)?;
        Ok(path)
    }

    pub fn read_status(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid status file {}: {}", path.display(), e),
            ))
        })
    }
}
