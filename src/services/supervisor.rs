use super::Service;
use crate::state::AppState;
use std::time::Duration;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info};

/// Cadence of the housekeeping pass: pending-authorization sweep, session
/// prune, rate-limiter state cleanup.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Drives the worker supervisor's periodic work: idle reaping, liveness
/// sweeps, and assorted map housekeeping. Shutting this service down stops
/// every worker process.
pub struct SupervisorService {
    state: AppState,
}

impl SupervisorService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl Service for SupervisorService {
    fn name(&self) -> &'static str {
        "supervisor"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let config = &self.state.config;
        let start = Instant::now();
        // interval_at skips the immediate first tick; sweeping a
        // just-initialized worker table is pointless.
        let mut reap = interval_at(start + config.reap_interval, config.reap_interval);
        let mut liveness = interval_at(
            start + config.liveness_interval,
            config.liveness_interval,
        );
        let mut maintenance = interval_at(start + MAINTENANCE_INTERVAL, MAINTENANCE_INTERVAL);
        let mut snapshot = interval_at(
            start + config.snapshot_interval,
            config.snapshot_interval,
        );

        loop {
            tokio::select! {
                _ = reap.tick() => {
                    self.state.supervisor.reap_idle().await;
                }
                _ = liveness.tick() => {
                    self.state.supervisor.liveness_sweep().await;
                }
                _ = maintenance.tick() => {
                    let swept = self.state.broker.sweep_pending();
                    let pruned = self.state.sessions.prune_expired();
                    self.state.limiter.sweep();
                    debug!(swept, pruned, "housekeeping pass completed");
                }
                _ = snapshot.tick() => {
                    let instances = self.state.supervisor.counters();
                    let sessions = self.state.sessions.counters();
                    info!(
                        total_instances = instances.total_instances,
                        user_instances = instances.user_instances,
                        running_instances = instances.running_instances,
                        default_status = %instances.default_instance_status,
                        sessions = sessions.total_sessions,
                        authenticated = sessions.authenticated_sessions,
                        "state snapshot"
                    );
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        self.state.supervisor.shutdown().await;
        Ok(())
    }
}
