use std::time::Duration;

use rand::Rng;

use crate::config::SimulationConfig;
use crate::scheduler::{TaskKey, WorkerEventKind};

/// Runs tasks by sleeping for a random latency.
///
/// Commands starting with `fail` always fail (retryable); otherwise an attempt
/// fails with probability `failure_rate`.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    config: SimulationConfig,
}

impl SimulatedExecutor {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, task: &TaskKey, command: &str) -> WorkerEventKind {
        let (latency, failed) = self.roll(command);
        tracing::info!(
            task = %task,
            command,
            latency_ms = latency.as_millis() as u64,
            "Executing task"
        );

        tokio::time::sleep(latency).await;

        if failed {
            tracing::info!(task = %task, "Task attempt failed");
            WorkerEventKind::Failed {
                reason: format!("simulated failure running {command:?}"),
                retryable: true,
            }
        } else {
            tracing::info!(task = %task, "Task attempt succeeded");
            WorkerEventKind::Succeeded
        }
    }

    fn roll(&self, command: &str) -> (Duration, bool) {
        let mut rng = rand::thread_rng();
        let min = self.config.min_latency_ms;
        let max = self.config.max_latency_ms.max(min);
        let latency = Duration::from_millis(rng.gen_range(min..=max));
        let failed = command.starts_with("fail")
            || rng.gen_bool(self.config.failure_rate.clamp(0.0, 1.0));
        (latency, failed)
    }
}
