use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::InMemoryCluster;
use crate::node::SchedulerHandle;

/// Periodically reports every simulated worker as alive.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(&self, cluster: InMemoryCluster, handle: SchedulerHandle, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for event in cluster.heartbeat_events() {
                        if handle.membership(event).await.is_err() {
                            tracing::debug!("Scheduler gone, stopping heartbeats");
                            return;
                        }
                    }
                }
            }
        }
    }
}
