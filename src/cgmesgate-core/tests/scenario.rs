//! End-to-end scenarios for the validation service.
//!
//! The Java launcher is replaced by a shell script that logs its argv and
//! imitates the engine (`rsl.jar`, writes into `-o`) and the report
//! converter (`qar2xlsx.jar`, writes an `.xlsx` into its argument).

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use cgmesgate_core::archive::zip_from_entries;
use cgmesgate_core::config::OverflowMode;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use cgmesgate_core::{
    JobState, ModelUpload, ReadinessState, ServiceConfig, UploadedArchive, ValidationGate,
    ValidationService,
};
use tempfile::TempDir;

const BOUNDARY: &str = "20210101T0000Z__ENTSOE_BD_001.xml";
const WAIT: Duration = Duration::from_secs(30);

const ENGINE_OK: &str = r#"out=""; prev=""
    for a in "$@"; do
      if [ "$prev" = "-o" ]; then out="$a"; fi
      prev="$a"
    done
    echo "<qar/>" > "$out/qar.xml"
    echo "engine ok""#;

const CONVERTER_OK: &str = r#"echo xlsx > "$3/report.xlsx""#;

struct Harness {
    temp: TempDir,
    config: ServiceConfig,
    service: ValidationService,
}

impl Harness {
    fn new(engine: &str, converter: &str, tune: impl FnOnce(&mut ServiceConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let launcher = write_launcher(temp.path(), engine, converter);

        let mut config = ServiceConfig::default();
        config.data_dir = temp.path().join("data");
        config.java.path = Some(launcher);
        config.execution.kill_grace_secs = 1;
        tune(&mut config);

        let service = ValidationService::open(config.clone()).unwrap();
        Self {
            temp,
            config,
            service,
        }
    }

    fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.temp.path().join("launcher.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn jobs_dir_entries(&self) -> usize {
        fs::read_dir(self.temp.path().join("data/jobs")).unwrap().count()
    }

    fn install(&self) {
        self.service.install_rsl(&rsl_bundle("1.0.TEST")).unwrap();
        assert_eq!(self.service.readiness(), ReadinessState::Ready);
    }
}

fn write_launcher(dir: &Path, engine: &str, converter: &str) -> PathBuf {
    let path = dir.join("java");
    let log = dir.join("launcher.log");
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> '{log}'\ncase \"$2\" in\n  *rsl.jar)\n    {engine}\n    ;;\n  *qar2xlsx.jar)\n    {converter}\n    ;;\nesac\n",
        log = log.display(),
        engine = engine,
        converter = converter,
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn rsl_bundle(version: &str) -> UploadedArchive {
    let manifest = format!(
        "<ns:Root xmlns:ns='http://entsoe.eu/CIM/Extensions/CGM-BP/2020#'><ns:rslVersion>{}</ns:rslVersion></ns:Root>",
        version
    );
    let bytes = zip_from_entries([
        ("RSL_1.0/", &b""[..]),
        ("RSL_1.0/config/", &b""[..]),
        ("RSL_1.0/config/rsl.jar", &b"engine jar"[..]),
        ("RSL_1.0/config/qar2xlsx.jar", &b"converter jar"[..]),
        ("RSL_1.0/config/config.xml", manifest.as_bytes()),
    ])
    .unwrap();
    UploadedArchive::new("RSL_1.0.zip", bytes)
}

fn boundary() -> ModelUpload {
    ModelUpload::new(BOUNDARY, b"<rdf:RDF/>".to_vec())
}

#[test]
fn test_submit_before_ready_never_invokes_launcher() {
    let h = Harness::new(ENGINE_OK, CONVERTER_OK, |_| {});

    let err = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap_err();

    assert_eq!(err.kind(), "system_not_ready");
    assert!(h.invocations().is_empty());
    assert_eq!(h.service.health().running_jobs, 0);
    assert_eq!(h.jobs_dir_entries(), 0);
}

#[test]
fn test_full_scenario() {
    let h = Harness::new(ENGINE_OK, CONVERTER_OK, |_| {});

    // A 10 MB archive smuggling a traversal entry is rejected whole.
    let filler = vec![0u8; 10 * 1024 * 1024];
    let hostile = zip_from_entries([
        ("RSL/config/rsl.jar", &filler[..]),
        ("../../etc/passwd", &b"root:x:0:0::/root:/bin/sh"[..]),
    ])
    .unwrap();
    let err = h
        .service
        .install_rsl(&UploadedArchive::new("RSL.zip", hostile))
        .unwrap_err();
    assert_eq!(err.kind(), "archive_error");
    assert_eq!(h.service.readiness(), ReadinessState::NotReady);
    assert!(!h.temp.path().join("etc").exists());
    assert!(!h.temp.path().join("data/etc").exists());

    // A valid bundle makes the system Ready.
    h.install();
    assert_eq!(h.service.rsl_version().as_deref(), Some("1.0.TEST"));

    // BDS on a boundary file succeeds with a report.
    let id = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let job = h.service.wait(id, WAIT).unwrap();

    assert_eq!(job.state, JobState::Succeeded, "job: {:?}", job);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.stdout.contains("engine ok"));
    assert_eq!(job.rsl_version.as_deref(), Some("1.0.TEST"));
    assert_eq!(job.inputs, vec![BOUNDARY.to_string()]);
    let report = job.report.clone().unwrap();
    assert_eq!(fs::read_to_string(&report).unwrap().trim(), "xlsx");
    assert!(job.results_archive.as_ref().unwrap().exists());
    assert_eq!(h.jobs_dir_entries(), 0);

    let status = fs::read_to_string(h.service.results_dir_for(id).join("status.json")).unwrap();
    assert!(status.contains("\"state\": \"succeeded\""));

    let calls = h.invocations();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("-vg bds"));
    assert!(calls[1].contains("qar2xlsx.jar"));

    // Full with only a boundary file is refused before anything runs.
    let err = h.service.submit(ValidationGate::Full, vec![boundary()]).unwrap_err();
    assert_eq!(err.kind(), "invalid_gate_input");
    assert_eq!(h.service.jobs().len(), 1);
    assert_eq!(h.invocations().len(), 2);
    assert_eq!(h.jobs_dir_entries(), 0);
}

#[test]
fn test_zip_model_upload_is_flattened() {
    let h = Harness::new(ENGINE_OK, CONVERTER_OK, |_| {});
    h.install();
    let models = zip_from_entries([
        ("igm/", &b""[..]),
        ("igm/20210101T0000Z_1D_TSO1_EQ_001.xml", &b"eq"[..]),
        ("igm/20210101T0000Z_1D_TSO2_EQ_001.xml", &b"eq"[..]),
    ])
    .unwrap();

    let id = h
        .service
        .submit(
            ValidationGate::FullCgm,
            vec![boundary(), ModelUpload::new("models.zip", models)],
        )
        .unwrap();
    let job = h.service.wait(id, WAIT).unwrap();

    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.inputs.len(), 3);
    assert!(h.invocations()[0].contains("-vg full_cgm"));
}

#[test]
fn test_hostile_model_upload_leaves_nothing_behind() {
    let h = Harness::new(ENGINE_OK, CONVERTER_OK, |_| {});
    h.install();
    let hostile = zip_from_entries([("../../../escape.xml", &b"x"[..])]).unwrap();

    let err = h
        .service
        .submit(
            ValidationGate::Bds,
            vec![boundary(), ModelUpload::new("models.zip", hostile)],
        )
        .unwrap_err();

    assert_eq!(err.kind(), "archive_error");
    assert_eq!(h.jobs_dir_entries(), 0);
    assert!(h.service.jobs().is_empty());
    assert_eq!(h.service.health().running_jobs, 0);
}

/// True once `pid` no longer runs (gone, or a zombie awaiting reaping).
fn process_gone(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return true;
    }
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

#[test]
fn test_timeout_terminates_and_cleans_up() {
    let h = Harness::new(
        r#"sleep 30 & echo $! > "$(dirname "$0")/engine.pid"; sleep 30"#,
        CONVERTER_OK,
        |c| {
            c.execution.timeout_secs = 1;
        },
    );
    h.install();

    let id = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let job = h.service.wait(id, WAIT).unwrap();

    assert_eq!(job.state, JobState::TimedOut);
    assert_eq!(job.failure.as_ref().unwrap().kind, "timeout_error");
    assert!(job.report.is_none());
    assert_eq!(h.jobs_dir_entries(), 0);
    // Only the engine ran.
    assert_eq!(h.invocations().len(), 1);

    // The engine's background child went down with its process group.
    let pid: i32 = fs::read_to_string(h.temp.path().join("engine.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let mut gone = process_gone(pid);
    for _ in 0..50 {
        if gone {
            break;
        }
        thread::sleep(Duration::from_millis(100));
        gone = process_gone(pid);
    }
    assert!(gone, "background engine process {} survived the timeout", pid);
}

#[test]
fn test_engine_failure_keeps_diagnostics() {
    let h = Harness::new("echo 'rule set broken' >&2; exit 3", CONVERTER_OK, |_| {});
    h.install();

    let id = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let job = h.service.wait(id, WAIT).unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(3));
    assert!(job.stderr.contains("rule set broken"));
    assert_eq!(job.failure.as_ref().unwrap().kind, "engine_execution_error");
    assert_eq!(h.invocations().len(), 1);
}

#[test]
fn test_missing_report_is_conversion_error() {
    let h = Harness::new(ENGINE_OK, "echo 'no excel today'", |_| {});
    h.install();

    let id = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let job = h.service.wait(id, WAIT).unwrap();

    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure.as_ref().unwrap().kind, "conversion_error");
    assert!(job.results_archive.as_ref().unwrap().exists());
    assert!(job.stdout.contains("no excel today"));
}

#[test]
fn test_capacity_bound_with_reject() {
    let h = Harness::new("sleep 2", CONVERTER_OK, |c| {
        c.capacity.max_running = 2;
        c.capacity.overflow = OverflowMode::Reject;
    });
    h.install();

    let first = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let second = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let err = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap_err();

    assert_eq!(err.kind(), "capacity_exceeded");
    assert!(h.service.health().running_jobs <= 2);

    h.service.wait(first, WAIT).unwrap();
    h.service.wait(second, WAIT).unwrap();
    assert_eq!(h.service.health().running_jobs, 0);
    assert!(h.service.submit(ValidationGate::Bds, vec![boundary()]).is_ok());
}

#[test]
fn test_capacity_queue() {
    let h = Harness::new("sleep 1; echo ran", CONVERTER_OK, |c| {
        c.capacity.max_running = 1;
        c.capacity.overflow = OverflowMode::Queue;
        c.capacity.queue_depth = 1;
    });
    h.install();

    let first = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let second = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    let err = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap_err();
    assert_eq!(err.kind(), "capacity_exceeded");

    let health = h.service.health();
    assert_eq!(health.max_running, 1);
    assert!(health.running_jobs <= 1);

    for id in [first, second] {
        let job = h.service.wait(id, WAIT).unwrap();
        assert!(job.state.is_terminal());
    }
    let health = h.service.health();
    assert_eq!((health.running_jobs, health.queued_jobs), (0, 0));
}

#[test]
fn test_restart_restores_readiness_and_sweeps_jobs() {
    let temp_root;
    let data_dir;
    {
        let h = Harness::new(ENGINE_OK, CONVERTER_OK, |_| {});
        h.install();
        data_dir = h.temp.path().join("data");
        // A workspace abandoned by a crashed run.
        fs::create_dir_all(data_dir.join("jobs").join(uuid_like())).unwrap();
        temp_root = h.temp;
    }

    let mut config = ServiceConfig::default();
    config.data_dir = data_dir.clone();
    config.java.path = Some(temp_root.path().join("java"));
    let service = ValidationService::open(config).unwrap();

    assert_eq!(service.readiness(), ReadinessState::Ready);
    assert_eq!(service.rsl_version().as_deref(), Some("1.0.TEST"));
    assert_eq!(fs::read_dir(data_dir.join("jobs")).unwrap().count(), 0);
    assert!(service.jobs().is_empty());
}

#[test]
fn test_second_service_on_same_data_dir_is_refused() {
    let h = Harness::new("sleep 2; echo \"<qar/>\" > \"$6/qar.xml\"", CONVERTER_OK, |_| {});
    h.install();

    let id = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    thread::sleep(Duration::from_millis(500));

    let err = ValidationService::open(h.config.clone()).unwrap_err();
    assert_eq!(err.kind(), "data_dir_locked");

    // The in-flight job kept its workspace.
    assert_eq!(h.jobs_dir_entries(), 1);
    let job = h.service.wait(id, WAIT).unwrap();
    assert_eq!(job.state, JobState::Succeeded, "job: {:?}", job);
    assert_eq!(h.service.readiness(), ReadinessState::Ready);

    // Ownership passes on once the first service is gone.
    let Harness { temp, config, service } = h;
    drop(service);
    let mut reopened = ValidationService::open(config.clone());
    for _ in 0..50 {
        if reopened.is_ok() {
            break;
        }
        // Worker threads hold the service until they exit.
        thread::sleep(Duration::from_millis(100));
        reopened = ValidationService::open(config.clone());
    }
    assert_eq!(reopened.unwrap().readiness(), ReadinessState::Ready);
    drop(temp);
}

#[test]
fn test_finished_jobs_are_evicted_but_stay_readable() {
    let h = Harness::new(ENGINE_OK, CONVERTER_OK, |c| {
        c.retention.max_finished_jobs = 1;
    });
    h.install();

    let first = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    assert_eq!(h.service.wait(first, WAIT).unwrap().state, JobState::Succeeded);
    let second = h.service.submit(ValidationGate::Bds, vec![boundary()]).unwrap();
    assert_eq!(h.service.wait(second, WAIT).unwrap().state, JobState::Succeeded);

    // Eviction follows the terminal status write on the worker thread.
    let held = || -> Vec<_> { h.service.jobs().iter().map(|j| j.id).collect() };
    for _ in 0..50 {
        if held().len() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(held(), vec![second]);

    // The evicted job is served from its status file.
    let first_job = h.service.job(first).unwrap();
    assert_eq!(first_job.state, JobState::Succeeded);
    assert!(first_job.stdout.contains("engine ok"));
    assert!(first_job.report.unwrap().exists());
    assert_eq!(h.service.wait(first, WAIT).unwrap().id, first);
}

fn uuid_like() -> String {
    "7f1d3c52-9a8e-4b6f-8c1a-2d3e4f5a6b7c".to_string()
}
