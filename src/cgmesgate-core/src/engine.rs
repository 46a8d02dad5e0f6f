//! Validation job orchestration.
//!
//! [`ValidationService`] ties the pieces together:
//!
//! ```text
//! submit ─▶ readiness ─▶ capacity ─▶ workspace + ingest ─▶ gate command
//!                                                              │
//!                     registry (Queued) ◀──────────────────────┘
//!                            │
//!                       worker thread ─▶ engine ─▶ converter ─▶ results/<job>/
//! ```
//!
//! Submission never blocks on the engine. Each job owns its workspace, its
//! capacity slot and a reference to the RSL bundle it was built against; all
//! three are released before the terminal state is published.

use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::archive::archive_directory;
use crate::capacity::{Admission, ConcurrencyController};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::execution::{run_invocation, ExecutionResult};
use crate::gate::{GateCommandBuilder, ProcessInvocation, ValidationGate};
use crate::job::{JobId, ValidationJob, STATUS_FILE};
use crate::lock::DataDirLock;
use crate::readiness::{Readiness, ReadinessState, RslBundle};
use crate::sanitize::ensure_within;
use crate::upload::{ingest_uploads, ModelUpload, UploadedArchive};
use crate::workspace::{Workspace, WorkspaceManager};

pub const REPORT_FILE: &str = "report.xlsx";
pub const RESULTS_ARCHIVE: &str = "results.zip";

/// Point-in-time view of the service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: ReadinessState,
    pub rsl_version: Option<String>,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub max_running: usize,
}

#[derive(Default)]
struct JobRegistry {
    jobs: Mutex<HashMap<JobId, ValidationJob>>,
    changed: Condvar,
}

impl JobRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, ValidationJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, job: ValidationJob) {
        self.lock().insert(job.id, job);
        self.changed.notify_all();
    }

    fn get(&self, id: JobId) -> Option<ValidationJob> {
        self.lock().get(&id).cloned()
    }

    /// Drop the oldest terminal jobs beyond `keep`. Returns how many went.
    fn evict_finished(&self, keep: usize) -> usize {
        let mut jobs = self.lock();
        let mut finished: Vec<_> = jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .map(|job| (job.finished_at, job.id))
            .collect();
        if finished.len() <= keep {
            return 0;
        }

        finished.sort_by_key(|(finished_at, _)| *finished_at);
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
        excess
    }

    /// Apply `f` to a job and return the updated copy.
    fn update<F: FnOnce(&mut ValidationJob)>(&self, id: JobId, f: F) -> Option<ValidationJob> {
        let updated = {
            let mut jobs = self.lock();
            let job = jobs.get_mut(&id)?;
            f(job);
            job.clone()
        };
        self.changed.notify_all();
        Some(updated)
    }

    fn wait_terminal(&self, id: JobId, timeout: Duration) -> Option<ValidationJob> {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.lock();
        loop {
            let job = jobs.get(&id)?;
            let now = Instant::now();
            if job.state.is_terminal() || now >= deadline {
                return Some(job.clone());
            }
            jobs = self
                .changed
                .wait_timeout(jobs, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct Shared {
    _lock: DataDirLock,
    config: ServiceConfig,
    launcher: PathBuf,
    readiness: Readiness,
    workspaces: WorkspaceManager,
    capacity: Arc<ConcurrencyController>,
    results_dir: PathBuf,
    registry: JobRegistry,
}

/// The validation service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ValidationService {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationService").finish_non_exhaustive()
    }
}

impl ValidationService {
    /// Open the data directory, restore readiness and sweep leftover job
    /// workspaces. Jobs from a previous run are not restored.
    ///
    /// The service owns the data directory until its last clone is dropped;
    /// a second open fails with [`Error::DataDirLocked`] and touches nothing.
    pub fn open(config: ServiceConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir).map_err(|e| Error::workspace(&config.data_dir, e))?;
        let lock = DataDirLock::acquire(&config.data_dir)?;

        let readiness = Readiness::open(config.rsl_dir(), config.archive)?;
        let workspaces = WorkspaceManager::new(config.jobs_dir())?;
        workspaces.sweep_stale(&[])?;

        let results_dir = config.results_dir();
        fs::create_dir_all(&results_dir).map_err(|e| Error::workspace(&results_dir, e))?;

        let capacity =
            ConcurrencyController::new(config.capacity.max_running, config.capacity.policy());

        info!(
            "data_dir={} state={} max_running={} policy={:?} Validation service opened",
            config.data_dir.display(),
            readiness.current_state(),
            capacity.max_running(),
            capacity.policy()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                _lock: lock,
                launcher: config.launcher(),
                config,
                readiness,
                workspaces,
                capacity,
                results_dir,
                registry: JobRegistry::default(),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    pub fn readiness(&self) -> ReadinessState {
        self.shared.readiness.current_state()
    }

    pub fn rsl_version(&self) -> Option<String> {
        self.shared.readiness.version()
    }

    pub fn install_rsl(&self, upload: &UploadedArchive) -> Result<Arc<RslBundle>> {
        self.shared.readiness.install_rsl(upload)
    }

    /// Accept a validation request and return immediately.
    ///
    /// # Errors
    /// - [`Error::SystemNotReady`] unless an RSL bundle is active
    /// - [`Error::CapacityExceeded`] when no running or queue slot is free
    /// - archive/sanitization errors for bad uploads
    /// - [`Error::InvalidGateInput`] when the inputs do not fit the gate
    ///
    /// No job exists and no workspace remains after any of these.
    pub fn submit(&self, gate: ValidationGate, uploads: Vec<ModelUpload>) -> Result<JobId> {
        let shared = &self.shared;

        let bundle = shared.readiness.active_bundle()?;
        let admission = shared.capacity.admit()?;

        let workspace = shared.workspaces.create_job()?;
        let files = ingest_uploads(&uploads, &workspace.in_dir(), &shared.config.archive)?;

        let (engine, converter) = {
            let builder = GateCommandBuilder::new(&shared.launcher, &bundle, &workspace);
            (builder.build(gate, &files)?, builder.converter()?)
        };

        let id = JobId::new();
        let inputs = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        let job = ValidationJob::new(id, gate, inputs, bundle.version().map(str::to_string));
        job.write_status(&self.results_dir_for(id))?;
        shared.registry.insert(job);

        info!(
            "job={} gate={} inputs={} queued={} Job submitted",
            id,
            gate,
            files.len(),
            admission.is_queued()
        );

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || run_job(worker_shared, id, admission, workspace, bundle, engine, converter));

        if let Err(e) = spawned {
            let err = Error::Io(e);
            error!("job={} error={} Failed to start worker", id, err);
            self.publish(id, |job| {
                job.fail(&err);
            });
            return Err(err);
        }

        Ok(id)
    }

    /// Live record of a job, or its status file once it has been evicted.
    pub fn job(&self, id: JobId) -> Option<ValidationJob> {
        self.shared
            .registry
            .get(id)
            .or_else(|| self.stored_job(id))
    }

    /// Jobs held in memory, oldest first: everything unfinished plus the
    /// most recent finished ones.
    pub fn jobs(&self) -> Vec<ValidationJob> {
        let mut jobs: Vec<_> = self.shared.registry.lock().values().cloned().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Block until the job is terminal or `timeout` elapses; returns the
    /// latest snapshot either way. None for unknown ids.
    pub fn wait(&self, id: JobId, timeout: Duration) -> Option<ValidationJob> {
        self.shared
            .registry
            .wait_terminal(id, timeout)
            .or_else(|| self.stored_job(id))
    }

    fn stored_job(&self, id: JobId) -> Option<ValidationJob> {
        ValidationJob::read_status(&self.results_dir_for(id).join(STATUS_FILE)).ok()
    }

    pub fn health(&self) -> HealthSnapshot {
        let (running_jobs, queued_jobs) = self.shared.capacity.snapshot();
        HealthSnapshot {
            state: self.shared.readiness.current_state(),
            rsl_version: self.shared.readiness.version(),
            running_jobs,
            queued_jobs,
            max_running: self.shared.capacity.max_running(),
        }
    }

    /// Durable result directory of a job: `<data>/results/<job>/`.
    pub fn results_dir_for(&self, id: JobId) -> PathBuf {
        self.shared.results_dir.join(id.to_string())
    }

    fn publish<F: FnOnce(&mut ValidationJob)>(&self, id: JobId, f: F) {
        publish(&self.shared, id, f);
    }
}

/// Update a job in the registry and mirror it to its status file.
///
/// Once a job is terminal its status file is the durable record, so older
/// finished jobs past the retention bound leave memory here.
fn publish<F: FnOnce(&mut ValidationJob)>(shared: &Shared, id: JobId, f: F) {
    let Some(job) = shared.registry.update(id, f) else {
        return;
    };
    let dir = shared.results_dir.join(id.to_string());
    let stored = match job.write_status(&dir) {
        Ok(_) => true,
        Err(e) => {
            warn!("job={} error={} Failed to write status file", id, e);
            false
        }
    };

    if job.state.is_terminal() && stored {
        let evicted = shared
            .registry
            .evict_finished(shared.config.retention.max_finished_jobs);
        if evicted > 0 {
            debug!("evicted={} Dropped finished jobs from memory", evicted);
        }
    }
}

/// Everything a finished job reports back.
#[derive(Default)]
struct JobOutcome {
    engine: Option<ExecutionResult>,
    converter: Option<ExecutionResult>,
    report: Option<PathBuf>,
    results_archive: Option<PathBuf>,
    error: Option<Error>,
}

fn run_job(
    shared: Arc<Shared>,
    id: JobId,
    admission: Admission,
    mut workspace: Workspace,
    bundle: Arc<RslBundle>,
    engine: ProcessInvocation,
    converter: ProcessInvocation,
) {
    let permit = admission.wait_for_slot();
    publish(&shared, id, |job| {
        job.start();
    });
    info!("job={} workspace={} state=running Starting engine", id, workspace.id());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        execute_job(&shared, id, &workspace, &engine, &converter)
    }))
    .unwrap_or_else(|_| JobOutcome {
        error: Some(Error::EngineExecution("job worker panicked".to_string())),
        ..JobOutcome::default()
    });

    // Release everything before the terminal state becomes visible.
    if let Err(e) = workspace.cleanup() {
        warn!("job={} error={} Failed to remove workspace", id, e);
    }
    drop(workspace);
    drop(permit);
    drop(bundle);

    publish(&shared, id, |job| {
        if let Some(engine) = &outcome.engine {
            job.exit_code = engine.exit_code;
            job.stdout = engine.stdout.clone();
            job.stderr = engine.stderr.clone();
        }
        if let Some(converter) = &outcome.converter {
            append_section(&mut job.stdout, "converter", &converter.stdout);
            append_section(&mut job.stderr, "converter", &converter.stderr);
        }
        job.report = outcome.report.clone();
        job.results_archive = outcome.results_archive.clone();
        match &outcome.error {
            None => {
                job.succeed();
            }
            Some(err) => {
                job.fail(err);
            }
        }
    });

    match &outcome.error {
        None => info!("job={} state=succeeded Validation finished", id),
        Some(e) => warn!("job={} kind={} error={} Validation did not succeed", id, e.kind(), e),
    }
}

fn append_section(buf: &mut String, name: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    if !buf.is_empty() && !buf.ends_with('\n') {
        buf.push('\n');
    }
    buf.push_str(&format!("[{}]\n{}", name, text));
}

fn execute_job(
    shared: &Shared,
    id: JobId,
    workspace: &Workspace,
    engine: &ProcessInvocation,
    converter: &ProcessInvocation,
) -> JobOutcome {
    let results_dir = shared.results_dir.join(id.to_string());
    let engine_policy = shared.config.execution.engine_policy();
    let mut outcome = JobOutcome::default();

    let engine_result = match run_invocation(engine, &workspace.tmp_dir(), &engine_policy) {
        Ok(result) => result,
        Err(e) => {
            outcome.error = Some(e);
            return outcome;
        }
    };

    outcome.error = if engine_result.timed_out {
        Some(Error::Timeout(engine_policy.timeout))
    } else if !engine_result.success {
        Some(Error::EngineExecution(
            engine_result
                .error
                .clone()
                .unwrap_or_else(|| "engine failed".to_string()),
        ))
    } else {
        None
    };
    let engine_ok = outcome.error.is_none();
    outcome.engine = Some(engine_result);

    if engine_ok {
        debug!("job={} Running report converter", id);
        let policy = shared.config.execution.converter_policy();
        match run_invocation(converter, &workspace.tmp_dir(), &policy) {
            Ok(result) => {
                outcome.error = if result.timed_out {
                    Some(Error::Conversion(format!(
                        "converter timed out after {}s",
                        policy.timeout.as_secs()
                    )))
                } else if !result.success {
                    Some(Error::Conversion(
                        result.error.clone().unwrap_or_else(|| "converter failed".to_string()),
                    ))
                } else {
                    match store_report(&workspace.out_dir(), &results_dir) {
                        Ok(path) => {
                            outcome.report = Some(path);
                            None
                        }
                        Err(e) => Some(e),
                    }
                };
                outcome.converter = Some(result);
            }
            Err(e) => outcome.error = Some(Error::Conversion(e.to_string())),
        }
    }

    let archive_path = results_dir.join(RESULTS_ARCHIVE);
    match fs::create_dir_all(&results_dir)
        .map_err(Error::from)
        .and_then(|()| archive_directory(&workspace.out_dir(), &archive_path))
    {
        Ok(count) => {
            debug!("job={} files={} Archived engine output", id, count);
            outcome.results_archive = Some(archive_path);
        }
        Err(e) => warn!("job={} error={} Failed to archive engine output", id, e),
    }

    outcome
}

/// Copy the converter's `.xlsx` out of the workspace.
fn store_report(out_dir: &Path, results_dir: &Path) -> Result<PathBuf> {
    let mut reports: Vec<PathBuf> = fs::read_dir(out_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("xlsx"))
                .unwrap_or(false)
        })
        // SECURITY: only regular files; a symlink would be followed by copy.
        .filter(|path| fs::symlink_metadata(path).map(|m| m.is_file()).unwrap_or(false))
        .collect();
    reports.sort();

    let report = reports
        .into_iter()
        .next()
        .ok_or_else(|| Error::Conversion("no .xlsx report produced".to_string()))?;
    let report = ensure_within(out_dir, &report)?;

    fs::create_dir_all(results_dir)?;
    let target = results_dir.join(REPORT_FILE);
    fs::copy(&report, &target)?;
    Ok(target)
}
