//! Process execution for the validation engine and the report converter.
//!
//! Provides isolated execution of a [`ProcessInvocation`] with:
//! - Own process group (the whole group is signalled on timeout)
//! - Cleared environment plus an explicit allow-list, `TMPDIR` in the workspace
//! - Optional rlimits (CPU seconds, open files, file size)
//! - Bounded stdout/stderr capture on dedicated reader threads
//! - Wall-clock timeout: SIGTERM, grace period, SIGKILL, reap
//!
//! The wait loop polls `try_wait` every 100ms and never blocks the caller
//! past the timeout plus the grace period.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};

use crate::error::{Error, Result};
use crate::gate::ProcessInvocation;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8192;

/// Kernel resource limits applied in the child before exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
}

/// How one external process is run.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL on timeout.
    pub kill_grace: Duration,
    /// Per-stream capture bound.
    pub max_output_bytes: usize,
    /// Variables copied from the service environment; everything else is cleared.
    pub env_allowlist: Vec<String>,
    pub limits: ResourceLimits,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1200),
            kill_grace: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "TZ", "JAVA_HOME"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Outcome of one process run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Whether the process exited with code 0
    pub success: bool,
    /// Exit code (if exited normally)
    pub exit_code: Option<i32>,
    /// Signal number (if killed by signal)
    pub signal: Option<i32>,
    /// Whether the wall-clock timeout fired
    pub timed_out: bool,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
    /// Error message (if failed)
    pub error: Option<String>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Run an invocation to completion (or timeout) and capture its output.
///
/// # Errors
/// [`Error::EngineExecution`] when the process cannot be spawned. A
/// non-zero exit, a signal or a timeout are reported in the result, not as
/// errors.
pub fn run_invocation(
    invocation: &ProcessInvocation,
    tmp_dir: &Path,
    policy: &ExecutionPolicy,
) -> Result<ExecutionResult> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for key in &policy.env_allowlist {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("TMPDIR", tmp_dir);

    #[cfg(unix)]
    {
        cmd.process_group(0);
        apply_resource_limits(&mut cmd, policy.limits);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        Error::EngineExecution(format!(
            "failed to spawn {}: {}",
            invocation.program.display(),
            e
        ))
    })?;
    debug!("pid={} Spawned {}", child.id(), invocation.describe());

    let stdout = child
        .stdout
        .take()
        .map(|s| drain_bounded(s, policy.max_output_bytes));
    let stderr = child
        .stderr
        .take()
        .map(|s| drain_bounded(s, policy.max_output_bytes));

    let (status, timed_out) = wait_with_timeout(&mut child, policy)?;
    let duration = start.elapsed();

    let stdout = collect(stdout);
    let stderr = collect(stderr);

    let exit_code = status.code();
    #[cfg(unix)]
    let signal = status.signal();
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    let error = if timed_out {
        Some(format!("timed out after {}s", policy.timeout.as_secs()))
    } else if let Some(code) = exit_code.filter(|c| *c != 0) {
        Some(format!("exited with code {}", code))
    } else {
        signal.map(|s| format!("killed by signal {}", s))
    };

    let result = ExecutionResult {
        success: !timed_out && status.success(),
        exit_code,
        signal,
        timed_out,
        duration,
        stdout,
        stderr,
        error,
    };

    info!(
        "program={} exit_code={:?} signal={:?} timed_out={} duration={:.1}s Process finished",
        invocation.program.display(),
        result.exit_code,
        result.signal,
        result.timed_out,
        duration.as_secs_f64()
    );
    Ok(result)
}

fn wait_with_timeout(child: &mut Child, policy: &ExecutionPolicy) -> Result<(ExitStatus, bool)> {
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait()? {
            // Stragglers in the group would keep our pipes open.
            signal_group(child, SignalKind::Kill);
            return Ok((status, false));
        }

        if start.elapsed() > policy.timeout {
            warn!(
                "pid={} timeout={}s Process exceeded timeout, terminating group",
                child.id(),
                policy.timeout.as_secs()
            );
            let status = terminate(child, policy.kill_grace)?;
            return Ok((status, true));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM the group, wait up to `grace`, then SIGKILL and reap.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    signal_group(child, SignalKind::Term);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            signal_group(child, SignalKind::Kill);
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }

    signal_group(child, SignalKind::Kill);
    let _ = child.kill();
    Ok(child.wait()?)
}

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, kind: SignalKind) {
    let signal = match kind {
        SignalKind::Term => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
    };
    let pgid = Pid::from_raw(child.id() as i32);
    match killpg(pgid, signal) {
        Ok(()) => debug!("pgid={} Sent {:?} to process group", pgid, signal),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("pgid={} error={} Failed to signal process group", pgid, e),
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, kind: SignalKind) {
    if let SignalKind::Kill = kind {
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, limits: ResourceLimits) {
    use nix::sys::resource::{setrlimit, Resource};

    if limits == ResourceLimits::default() {
        return;
    }

    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || {
            let pairs = [
                (Resource::RLIMIT_CPU, limits.cpu_seconds),
                (Resource::RLIMIT_NOFILE, limits.max_open_files),
                (Resource::RLIMIT_FSIZE, limits.max_file_size_bytes),
            ];
            for (resource, value) in pairs {
                if let Some(v) = value {
                    setrlimit(resource, v as _, v as _).map_err(io::Error::from)?;
                }
            }
            Ok(())
        });
    }
}

/// Captured bytes plus how many were dropped past the bound.
struct Bounded {
    buf: Vec<u8>,
    dropped: u64,
}

fn drain_bounded<R: Read + Send + 'static>(mut reader: R, limit: usize) -> JoinHandle<Bounded> {
    thread::spawn(move || {
        let mut out = Bounded {
            buf: Vec::new(),
            dropped: 0,
        };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(out.buf.len());
                    let keep = room.min(n);
                    out.buf.extend_from_slice(&chunk[..keep]);
                    out.dropped += (n - keep) as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        out
    })
}

fn collect(handle: Option<JoinHandle<Bounded>>) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match handle.join() {
        Ok(bounded) => {
            let mut text = String::from_utf8_lossy(&bounded.buf).into_owned();
            if bounded.dropped > 0 {
                if !text.ends_with('\n') && !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&format!("[... truncated {} bytes]", bounded.dropped));
            }
            text
        }
        Err(_) => "[output capture failed]".to_string(),
    }
}
