use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::Resources;
use crate::error::{Result, SchedulerError};

/// Tuning knobs of the scheduling engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Retries allowed per task before its job starts compensating.
    pub retry_budget: u32,
    /// How long a worker may stay unreachable before its tasks are re-queued.
    pub orphan_grace_ms: u64,
    /// Bound between assignment and the worker reporting the task started.
    pub dispatch_timeout_ms: u64,
    /// Bound on silence from a running task (task or worker heartbeat).
    pub heartbeat_timeout_ms: u64,
    pub scheduling_interval_ms: u64,
    /// Log length that triggers compaction after a scheduling pass.
    pub compaction_threshold: u64,
    /// Fail a job whose task has been waiting for placement this long.
    pub max_runnable_age_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            orphan_grace_ms: 30_000,
            dispatch_timeout_ms: 10_000,
            heartbeat_timeout_ms: 30_000,
            scheduling_interval_ms: 100,
            compaction_threshold: 10_000,
            max_runnable_age_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn orphan_grace(&self) -> Duration {
        Duration::from_millis(self.orphan_grace_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn scheduling_interval(&self) -> Duration {
        Duration::from_millis(self.scheduling_interval_ms)
    }

    pub fn max_runnable_age(&self) -> Option<Duration> {
        self.max_runnable_age_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduling_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "scheduling_interval_ms must be positive".to_string(),
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(SchedulerError::Config(
                "compaction_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the saga log lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SagaLogConfig {
    Memory,
    File { path: PathBuf },
}

impl Default for SagaLogConfig {
    fn default() -> Self {
        SagaLogConfig::Memory
    }
}

/// Membership provider for the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterConfig {
    /// A fixed set of simulated workers inside this process.
    InMemory {
        count: usize,
        #[serde(default = "default_worker_capacity")]
        capacity: Resources,
    },
}

fn default_worker_capacity() -> Resources {
    Resources::new(4_000, 8_192)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::InMemory {
            count: 10,
            capacity: default_worker_capacity(),
        }
    }
}

/// Behaviour of the simulated workers run by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Probability that a task attempt fails (retryable).
    pub failure_rate: f64,
    pub heartbeat_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            min_latency_ms: 50,
            max_latency_ms: 500,
            failure_rate: 0.0,
            heartbeat_interval_ms: 1_000,
        }
    }
}

impl SimulationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(SchedulerError::Config(format!(
                "failure_rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(SchedulerError::Config(
                "min_latency_ms exceeds max_latency_ms".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub saga_log: SagaLogConfig,
    pub cluster: ClusterConfig,
    pub workers: SimulationConfig,
}

impl AppConfig {
    /// Resolve a `--config` argument: a preset name, inline JSON, or a path
    /// to a JSON file.
    pub fn load(arg: &str) -> Result<Self> {
        let arg = arg.trim();
        let config = if let Some(preset) = Self::preset(arg) {
            preset
        } else if arg.starts_with('{') {
            serde_json::from_str(arg)
                .map_err(|e| SchedulerError::Config(format!("invalid inline config: {e}")))?
        } else {
            Self::from_file(Path::new(arg))?
        };
        config.scheduler.validate()?;
        config.workers.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchedulerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| SchedulerError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Built-in configurations.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "local.memory" => Some(Self::default()),
            "local.file" => Some(Self {
                saga_log: SagaLogConfig::File {
                    path: PathBuf::from("saga.log"),
                },
                ..Self::default()
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.retry_budget, 2);
        assert_eq!(cfg.orphan_grace(), Duration::from_secs(30));
        assert_eq!(cfg.scheduling_interval(), Duration::from_millis(100));
        assert_eq!(cfg.compaction_threshold, 10_000);
        assert!(cfg.max_runnable_age().is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_config_rejects_zero_interval() {
        let cfg = SchedulerConfig {
            scheduling_interval_ms: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(SchedulerError::Config(_))));
    }

    #[test]
    fn presets_resolve() {
        let memory = AppConfig::load("local.memory").unwrap();
        assert_eq!(memory.saga_log, SagaLogConfig::Memory);

        let file = AppConfig::load("local.file").unwrap();
        assert_eq!(
            file.saga_log,
            SagaLogConfig::File {
                path: PathBuf::from("saga.log")
            }
        );
    }

    #[test]
    fn inline_json_fills_defaults() {
        let cfg = AppConfig::load(
            r#"{"scheduler": {"retry_budget": 5}, "cluster": {"type": "in_memory", "count": 3}}"#,
        )
        .unwrap();
        assert_eq!(cfg.scheduler.retry_budget, 5);
        assert_eq!(cfg.scheduler.orphan_grace_ms, 30_000);
        assert_eq!(
            cfg.cluster,
            ClusterConfig::InMemory {
                count: 3,
                capacity: default_worker_capacity()
            }
        );
        assert_eq!(cfg.saga_log, SagaLogConfig::Memory);
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sched.json");
        std::fs::write(
            &path,
            r#"{"saga_log": {"type": "file", "path": "/var/lib/sched/saga.log"}}"#,
        )
        .unwrap();

        let cfg = AppConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(
            cfg.saga_log,
            SagaLogConfig::File {
                path: PathBuf::from("/var/lib/sched/saga.log")
            }
        );
    }

    #[test]
    fn bad_inputs_are_config_errors() {
        assert!(matches!(
            AppConfig::load("{not json"),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            AppConfig::load("/definitely/missing.json"),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            AppConfig::load(r#"{"scheduler": {"compaction_threshold": 0}}"#),
            Err(SchedulerError::Config(_))
        ));
        assert!(matches!(
            AppConfig::load(r#"{"workers": {"failure_rate": 1.5}}"#),
            Err(SchedulerError::Config(_))
        ));
    }
}
