//! cgmesgate Core Library
//!
//! Secure ingestion and job orchestration in front of an external CGMES
//! validation engine (a Java jar pair shipped in a Rule Set Library bundle).
//!
//! This crate provides:
//! - **sanitize**: File name allow-list and path containment checks
//! - **archive**: Secure zip extraction with traversal/symlink/bomb protection
//! - **workspace**: Exclusively-owned job and bootstrap directories (in/out/tmp)
//! - **manifest**: XXE-safe reader for the RSL `config.xml`
//! - **readiness**: RSL installation state machine (NotReady/Installing/Ready/Degraded)
//! - **gate**: Validation gates and argv-only engine/converter commands
//! - **execution**: Process execution (process group, timeout, bounded output)
//! - **capacity**: Running/queued job limits
//! - **job**: Job records and status files
//! - **engine**: The validation service tying it all together
//! - **lock**: Exclusive ownership of a data directory
//! - **config**: Service configuration (YAML + environment)
//! - **upload**: Uploaded files and data URLs
//!
//! # Security
//!
//! Everything arriving through an upload is hostile until proven otherwise:
//! names are allow-listed, archive paths are contained, XML never resolves
//! entities, and no value ever reaches a shell.

pub mod archive;
pub mod capacity;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod gate;
pub mod job;
pub mod lock;
pub mod manifest;
pub mod readiness;
pub mod sanitize;
pub mod upload;
pub mod workspace;

pub use error::{Error, Result};

pub use archive::{extract_zip, archive_directory, ArchiveEntry, ArchiveLimits, EntryKind, ExtractLayout};
pub use capacity::{Admission, ConcurrencyController, OverflowPolicy, RunPermit};
pub use config::ServiceConfig;
pub use engine::{HealthSnapshot, ValidationService};
pub use execution::{run_invocation, ExecutionPolicy, ExecutionResult, ResourceLimits};
pub use gate::{GateCommandBuilder, ProcessInvocation, ValidationGate};
pub use job::{JobFailure, JobId, JobState, ValidationJob};
pub use lock::DataDirLock;
pub use readiness::{Readiness, ReadinessState, RslBundle};
pub use upload::{ModelUpload, UploadedArchive};
pub use workspace::{Workspace, WorkspaceManager};
