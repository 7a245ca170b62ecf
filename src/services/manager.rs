use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::services::{Service, ServiceResult, run_service};

/// Manages the gateway's services and their lifecycle.
pub struct ServiceManager {
    registered: Vec<(String, Box<dyn Service>)>,
    running: JoinSet<(String, ServiceResult)>,
    spawned_names: Vec<String>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered: Vec::new(),
            running: JoinSet::new(),
            spawned_names: Vec::new(),
            shutdown_tx,
        }
    }

    /// Register a service to be managed (not yet spawned)
    pub fn register_service(&mut self, name: &str, service: Box<dyn Service>) {
        self.registered.push((name.to_owned(), service));
    }

    pub fn has_services(&self) -> bool {
        !self.registered.is_empty() || !self.running.is_empty()
    }

    /// Spawn all registered services
    pub fn spawn_all(&mut self) {
        for (name, service) in self.registered.drain(..) {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let task_name = name.clone();
            self.running.spawn(async move {
                let result = run_service(service, shutdown_rx).await;
                (task_name, result)
            });
            self.spawned_names.push(name);
        }

        info!(
            service_count = self.spawned_names.len(),
            services = ?self.spawned_names,
            "spawned {} services",
            self.spawned_names.len()
        );
    }

    /// Wait until any service completes or fails, returning its name and
    /// result. A completing service is abnormal; the caller shuts the rest
    /// down.
    pub async fn run(&mut self) -> (String, ServiceResult) {
        match self.running.join_next().await {
            Some(Ok((name, result))) => (name, result),
            Some(Err(e)) => (
                "unknown".to_owned(),
                ServiceResult::Error(anyhow::anyhow!("service task panicked: {e}")),
            ),
            None => (
                "none".to_owned(),
                ServiceResult::Error(anyhow::anyhow!("no services to run")),
            ),
        }
    }

    /// Shutdown all services gracefully with a timeout.
    ///
    /// Returns the elapsed time on success, or the names of the services
    /// that did not complete within the timeout.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        info!(
            service_count = self.running.len(),
            timeout = format!("{:.2?}", timeout),
            "shutting down services"
        );

        let _ = self.shutdown_tx.send(());

        let start_time = std::time::Instant::now();
        let mut completed = Vec::new();

        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.running.join_next().await {
                match joined {
                    Ok((name, _)) => {
                        debug!(service = name, "service shutdown completed");
                        completed.push(name);
                    }
                    Err(e) => warn!(error = %e, "service task failed during shutdown"),
                }
            }
        })
        .await;

        let elapsed = start_time.elapsed();
        if drained.is_ok() {
            info!(
                elapsed = format!("{:.2?}", elapsed),
                "services shutdown completed: {}",
                completed.join(", ")
            );
            Ok(elapsed)
        } else {
            self.running.abort_all();
            let pending: Vec<String> = self
                .spawned_names
                .iter()
                .filter(|name| !completed.contains(name))
                .cloned()
                .collect();
            warn!(
                pending_count = pending.len(),
                pending_services = ?pending,
                elapsed = format!("{:.2?}", elapsed),
                "services shutdown timed out with {} pending",
                pending.len()
            );
            Err(pending)
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
