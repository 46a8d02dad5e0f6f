//! Service configuration for cgmesgate.
//!
//! Loads configuration from:
//! 1. A YAML file (explicit path, or the first of the standard locations)
//! 2. Environment variables (override file config)
//!
//! Configuration structure:
//! ```yaml
//! data_dir: /var/lib/cgmesgate
//! java:
//!   path: /usr/lib/jvm/java-17/bin/java
//! archive:
//!   max_entry_bytes: 2147483648
//! execution:
//!   timeout_secs: 1200
//! capacity:
//!   max_running: 2
//!   overflow: queue
//!   queue_depth: 8
//! retention:
//!   max_finished_jobs: 256
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveLimits;
use crate::capacity::OverflowPolicy;
use crate::execution::{ExecutionPolicy, ResourceLimits};

/// Upper bound for any configured timeout.
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Java launcher configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JavaConfig {
    /// Absolute path to the java executable (default: /usr/bin/java)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// External process configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Engine wall-clock timeout in seconds (default: 1200)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Report converter timeout in seconds (default: 300)
    #[serde(default = "default_converter_timeout")]
    pub converter_timeout_secs: u64,

    /// Seconds between SIGTERM and SIGKILL on timeout (default: 5)
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Captured bytes per output stream (default: 1 MiB)
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Environment variables passed through to the engine
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,

    #[serde(default)]
    pub cpu_seconds: Option<u64>,

    #[serde(default)]
    pub max_open_files: Option<u64>,

    #[serde(default)]
    pub max_file_size_mb: Option<u64>,
}

fn default_timeout() -> u64 {
    1200
}

fn default_converter_timeout() -> u64 {
    300
}

fn default_kill_grace() -> u64 {
    5
}

fn default_max_output() -> usize {
    1024 * 1024
}

fn default_env_allowlist() -> Vec<String> {
    ["PATH", "LANG", "LC_ALL", "TZ", "JAVA_HOME"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            converter_timeout_secs: default_converter_timeout(),
            kill_grace_secs: default_kill_grace(),
            max_output_bytes: default_max_output(),
            env_allowlist: default_env_allowlist(),
            cpu_seconds: None,
            max_open_files: None,
            max_file_size_mb: None,
        }
    }
}

impl ExecutionConfig {
    fn policy(&self, timeout_secs: u64) -> ExecutionPolicy {
        ExecutionPolicy {
            timeout: Duration::from_secs(timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
            max_output_bytes: self.max_output_bytes,
            env_allowlist: self.env_allowlist.clone(),
            limits: ResourceLimits {
                cpu_seconds: self.cpu_seconds,
                max_open_files: self.max_open_files,
                max_file_size_bytes: self
                    .max_file_size_mb
                    .map(|mb| mb.saturating_mul(BYTES_PER_MB)),
            },
        }
    }

    pub fn engine_policy(&self) -> ExecutionPolicy {
        self.policy(self.timeout_secs)
    }

    pub fn converter_policy(&self) -> ExecutionPolicy {
        self.policy(self.converter_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    Queue,
    Reject,
}

/// Concurrency configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CapacityConfig {
    /// Engine processes allowed at once (default: 2)
    #[serde(default = "default_max_running")]
    pub max_running: usize,

    /// What happens to submissions past max_running (default: queue)
    #[serde(default = "default_overflow")]
    pub overflow: OverflowMode,

    /// Queue bound when overflow is `queue` (default: 8)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_max_running() -> usize {
    2
}

fn default_overflow() -> OverflowMode {
    OverflowMode::Queue
}

fn default_queue_depth() -> usize {
    8
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            max_running: default_max_running(),
            overflow: default_overflow(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl CapacityConfig {
    pub fn policy(&self) -> OverflowPolicy {
        match self.overflow {
            OverflowMode::Queue => OverflowPolicy::Queue {
                depth: self.queue_depth,
            },
            OverflowMode::Reject => OverflowPolicy::Reject,
        }
    }
}

/// In-memory job history
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Finished jobs kept in memory; older ones are served from their
    /// status file (default: 256)
    #[serde(default = "default_max_finished_jobs")]
    pub max_finished_jobs: usize,
}

fn default_max_finished_jobs() -> usize {
    256
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished_jobs: default_max_finished_jobs(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Root of durable state: rsl/, jobs/, results/
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub java: JavaConfig,

    #[serde(default)]
    pub archive: ArchiveLimits,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cgmesgate")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            java: JavaConfig::default(),
            archive: ArchiveLimits::default(),
            execution: ExecutionConfig::default(),
            capacity: CapacityConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Search order when `explicit` is None:
    /// 1. ./cgmesgate.yaml
    /// 2. ~/.cgmesgate.yaml
    /// 3. /etc/cgmesgate/config.yaml
    ///
    /// Environment variables override file settings:
    /// - CGMESGATE_DATA_DIR - Data directory
    /// - CGMESGATE_JAVA - Java launcher path
    /// - JAVA_HOME - Launcher becomes $JAVA_HOME/bin/java unless a path is configured
    /// - VALIDATION_TIMEOUT - Engine timeout in seconds
    /// - CGMESGATE_MAX_JOBS - Maximum concurrently running jobs
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::find_config_file() {
                Some(path) => Self::load_from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn find_config_file() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from("cgmesgate.yaml")];
        if let Ok(home) = env::var("HOME") {
            candidates.push(PathBuf::from(home).join(".cgmesgate.yaml"));
        }
        candidates.push(PathBuf::from("/etc/cgmesgate/config.yaml"));

        candidates.into_iter().find(|p| p.exists())
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = env::var("CGMESGATE_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(java) = env::var("CGMESGATE_JAVA") {
            self.java.path = Some(PathBuf::from(java));
        } else if self.java.path.is_none() {
            if let Ok(home) = env::var("JAVA_HOME") {
                self.java.path = Some(PathBuf::from(home).join("bin").join("java"));
            }
        }

        if let Ok(timeout) = env::var("VALIDATION_TIMEOUT") {
            self.execution.timeout_secs = timeout
                .trim()
                .parse()
                .context("Invalid VALIDATION_TIMEOUT value (must be seconds)")?;
        }

        if let Ok(max) = env::var("CGMESGATE_MAX_JOBS") {
            self.capacity.max_running = max
                .trim()
                .parse()
                .context("Invalid CGMESGATE_MAX_JOBS value (must be a number)")?;
        }

        Ok(())
    }

    /// Reject settings the service cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        let launcher = self.launcher();
        if !launcher.is_absolute() {
            bail!("Java launcher must be an absolute path: {}", launcher.display());
        }

        for (name, secs) in [
            ("execution.timeout_secs", self.execution.timeout_secs),
            ("execution.converter_timeout_secs", self.execution.converter_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_TIMEOUT_SECS {
                bail!("{} must be between 1 and {} (got {})", name, MAX_TIMEOUT_SECS, secs);
            }
        }
        if self.execution.kill_grace_secs > 300 {
            bail!("execution.kill_grace_secs must be at most 300");
        }
        if let Some(mb) = self.execution.max_file_size_mb {
            if mb == 0 || mb.checked_mul(BYTES_PER_MB).is_none() {
                bail!("execution.max_file_size_mb out of range (got {})", mb);
            }
        }
        if self.capacity.max_running == 0 {
            bail!("capacity.max_running must be at least 1");
        }
        if self.archive.max_entries == 0
            || self.archive.max_entry_bytes == 0
            || self.archive.max_total_bytes == 0
        {
            bail!("archive limits must be greater than zero");
        }

        Ok(())
    }

    /// Absolute path of the java executable.
    pub fn launcher(&self) -> PathBuf {
        self.java
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/usr/bin/java"))
    }

    pub fn rsl_dir(&self) -> PathBuf {
        self.data_dir.join("rsl")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    /// Create a sample configuration file
    pub fn create_sample(path: &Path) -> Result<()> {
        let sample = Self {
            java: JavaConfig {
                path: Some(PathBuf::from("/usr/bin/java")),
            },
            ..Self::default()
        };

        let yaml = serde_yaml::to_string(&sample).context("Failed to serialize sample config")?;

        let commented = format!(
            "# cgmesgate Validation Service Configuration\n\
             #\n\
             # Environment variables override these settings:\n\
             #   CGMESGATE_DATA_DIR  - Data directory (rsl/, jobs/, results/)\n\
             #   CGMESGATE_JAVA      - Java launcher (absolute path)\n\
             #   JAVA_HOME           - Used when no launcher is configured\n\
             #   VALIDATION_TIMEOUT  - Engine timeout in seconds\n\
             #   CGMESGATE_MAX_JOBS  - Concurrently running validations\n\
             #\n\
             # capacity.overflow: queue (wait up to queue_depth) or reject\n\
             #\n\
             {}\n",
            yaml
        );

        fs::write(path, commented)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
data_dir: /srv/cgmes
java:
  path: /opt/java/bin/java
execution:
  timeout_secs: 60
  cpu_seconds: 600
capacity:
  max_running: 4
  overflow: reject
"#;

        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(yaml.as_bytes()).unwrap();
        temp.flush().unwrap();

        let config = ServiceConfig::load_from_file(temp.path()).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/cgmes"));
        assert_eq!(config.launcher(), PathBuf::from("/opt/java/bin/java"));
        assert_eq!(config.execution.timeout_secs, 60);
        assert_eq!(config.execution.converter_timeout_secs, 300);
        assert_eq!(config.execution.engine_policy().limits.cpu_seconds, Some(600));
        assert_eq!(config.capacity.policy(), OverflowPolicy::Reject);
        assert_eq!(config.archive, ArchiveLimits::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.execution.timeout_secs, 1200);
        assert_eq!(config.execution.kill_grace_secs, 5);
        assert_eq!(config.capacity.max_running, 2);
        assert_eq!(config.capacity.policy(), OverflowPolicy::Queue { depth: 8 });
        assert_eq!(config.retention.max_finished_jobs, 256);
        assert_eq!(config.launcher(), PathBuf::from("/usr/bin/java"));
        assert_eq!(config.rsl_dir(), PathBuf::from("/var/lib/cgmesgate/rsl"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServiceConfig::default();
        config.java.path = Some(PathBuf::from("java"));
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.execution.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.capacity.max_running = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_file_size_bounds() {
        let mut config = ServiceConfig::default();
        config.execution.max_file_size_mb = Some(u64::MAX / 1024);
        assert!(config.validate().is_err());
        // Building the policy must not overflow even unvalidated.
        assert_eq!(
            config.execution.engine_policy().limits.max_file_size_bytes,
            Some(u64::MAX)
        );

        config.execution.max_file_size_mb = Some(0);
        assert!(config.validate().is_err());

        config.execution.max_file_size_mb = Some(512);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.execution.engine_policy().limits.max_file_size_bytes,
            Some(512 * 1024 * 1024)
        );
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("CGMESGATE_DATA_DIR", "/tmp/cgmes-env");
        env::set_var("VALIDATION_TIMEOUT", "45");
        env::set_var("CGMESGATE_MAX_JOBS", "3");
        env::set_var("CGMESGATE_JAVA", "/env/java");

        let mut config = ServiceConfig::default();
        config.apply_env_overrides().unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/cgmes-env"));
        assert_eq!(config.execution.timeout_secs, 45);
        assert_eq!(config.capacity.max_running, 3);
        assert_eq!(config.launcher(), PathBuf::from("/env/java"));

        env::set_var("VALIDATION_TIMEOUT", "soon");
        assert!(config.apply_env_overrides().is_err());

        env::remove_var("CGMESGATE_DATA_DIR");
        env::remove_var("VALIDATION_TIMEOUT");
        env::remove_var("CGMESGATE_MAX_JOBS");
        env::remove_var("CGMESGATE_JAVA");
    }

    #[test]
    fn test_create_sample() {
        let temp = NamedTempFile::new().unwrap();
        ServiceConfig::create_sample(temp.path()).unwrap();

        let content = fs::read_to_string(temp.path()).unwrap();
        assert!(content.contains("cgmesgate Validation Service Configuration"));
        assert!(content.contains("VALIDATION_TIMEOUT"));
        assert!(content.contains("execution:"));

        let parsed = ServiceConfig::load_from_file(temp.path()).unwrap();
        assert_eq!(parsed.launcher(), PathBuf::from("/usr/bin/java"));
    }
}
