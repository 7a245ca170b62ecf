//! Worker lifecycle supervisor.
//!
//! Owns the worker table: spawning, readiness waits, health probes, idle
//! reaping, and termination. The table, the default-worker slot, and port
//! bookkeeping sit behind one mutex held only for bookkeeping; every HTTP
//! probe, process spawn, and filesystem touch happens outside it.

use crate::worker::ports::PortAllocator;
use crate::worker::{DEFAULT_INSTANCE_ID, InstanceCounters, WorkerInfo, WorkerStatus};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bound on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll cadence while waiting for a concurrent creator or a stopping worker.
const WAIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("maximum worker instances reached")]
    MaxInstances,
    #[error("no free worker ports")]
    PortsExhausted,
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker exited during startup")]
    StartupExit,
    #[error("unknown worker instance {0}")]
    UnknownInstance(String),
}

/// Everything the supervisor needs from the gateway configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_binary: String,
    pub base_port: u16,
    pub default_port: u16,
    pub port_window: u16,
    pub max_instances: usize,
    pub idle_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    pub stop_grace: Duration,
    pub data_dir: PathBuf,
    pub idp_app_id: String,
    pub idp_app_secret: String,
}

impl SupervisorConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            worker_binary: config.worker_binary.clone(),
            base_port: config.worker_base_port,
            default_port: config.worker_default_port,
            port_window: config.worker_port_window,
            max_instances: config.max_instances,
            idle_timeout: config.idle_timeout,
            readiness_timeout: config.readiness_timeout,
            readiness_poll: config.readiness_poll,
            stop_grace: config.stop_grace,
            data_dir: config.data_dir.clone(),
            idp_app_id: config.idp_app_id.clone(),
            idp_app_secret: config.idp_app_secret.clone(),
        }
    }
}

struct WorkerEntry {
    user_id: Option<String>,
    port: u16,
    status: WorkerStatus,
    created_at: Instant,
    /// Request activity only. Probe results land in `last_healthy`, so a
    /// worker nobody talks to still ages toward the idle reaper.
    last_activity: Instant,
    last_healthy: Option<Instant>,
    token_dir: PathBuf,
    pid: Option<u32>,
}

impl WorkerEntry {
    fn snapshot(&self, instance_id: &str) -> WorkerInfo {
        WorkerInfo {
            instance_id: instance_id.to_owned(),
            user_id: self.user_id.clone(),
            port: self.port,
            status: self.status,
            created_at: self.created_at,
            last_activity: self.last_activity,
            last_healthy: self.last_healthy,
            token_dir: self.token_dir.clone(),
        }
    }
}

#[derive(Default)]
struct WorkerTable {
    workers: HashMap<String, WorkerEntry>,
    /// user id → instance id; excludes the default worker.
    by_user: HashMap<String, String>,
}

impl WorkerTable {
    fn user_instance_count(&self) -> usize {
        self.workers.len() - usize::from(self.workers.contains_key(DEFAULT_INSTANCE_ID))
    }

    fn ports_in_use(&self) -> HashSet<u16> {
        self.workers.values().map(|entry| entry.port).collect()
    }
}

/// Supervises worker child processes. Shared as `Arc<Supervisor>`; monitor
/// tasks hold clones to publish exits back into the table.
pub struct Supervisor {
    cfg: SupervisorConfig,
    allocator: PortAllocator,
    table: Mutex<WorkerTable>,
    probe: reqwest::Client,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> anyhow::Result<Arc<Self>> {
        let probe = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        let allocator = PortAllocator::new(cfg.base_port, cfg.port_window);
        Ok(Arc::new(Self {
            cfg,
            allocator,
            table: Mutex::new(WorkerTable::default()),
            probe,
        }))
    }

    /// Create the data directory and bring up the default worker. Failure
    /// here is a startup failure.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SupervisorError> {
        tokio::fs::create_dir_all(&self.cfg.data_dir)
            .await
            .map_err(|e| SupervisorError::Spawn(format!("cannot create data dir: {e}")))?;

        let token_dir = self.cfg.data_dir.join(DEFAULT_INSTANCE_ID);
        {
            let mut table = self.lock();
            table.workers.insert(
                DEFAULT_INSTANCE_ID.to_owned(),
                new_entry(None, self.cfg.default_port, token_dir.clone()),
            );
        }
        let info = self
            .launch(DEFAULT_INSTANCE_ID.to_owned(), None, token_dir)
            .await?;
        info!(port = info.port, "default worker ready");
        Ok(())
    }

    /// Return the user's running worker, creating one on demand. Concurrent
    /// callers for the same user converge on a single instance.
    pub async fn get_or_create(self: &Arc<Self>, user_id: &str) -> Result<WorkerInfo, SupervisorError> {
        enum Plan {
            Ready(WorkerInfo),
            Wait,
            Replace(String),
            Create { instance_id: String, token_dir: PathBuf },
        }

        let wait_deadline = Instant::now() + self.cfg.readiness_timeout + Duration::from_secs(5);
        loop {
            let plan = {
                let mut table = self.lock();
                if let Some(instance_id) = table.by_user.get(user_id).cloned() {
                    let entry = table
                        .workers
                        .get_mut(&instance_id)
                        .ok_or_else(|| SupervisorError::UnknownInstance(instance_id.clone()))?;
                    match entry.status {
                        WorkerStatus::Running => {
                            entry.last_activity = Instant::now();
                            Plan::Ready(entry.snapshot(&instance_id))
                        }
                        WorkerStatus::Starting | WorkerStatus::Stopping => Plan::Wait,
                        WorkerStatus::Error | WorkerStatus::Stopped => Plan::Replace(instance_id),
                    }
                } else {
                    if table.user_instance_count() >= self.cfg.max_instances {
                        return Err(SupervisorError::MaxInstances);
                    }
                    let port = self
                        .allocator
                        .allocate(&table.ports_in_use())
                        .ok_or(SupervisorError::PortsExhausted)?;
                    let instance_id = format!("u-{:08x}", rand::rng().random::<u32>());
                    let token_dir = self.cfg.data_dir.join(format!("user-{user_id}"));
                    table.workers.insert(
                        instance_id.clone(),
                        new_entry(Some(user_id.to_owned()), port, token_dir.clone()),
                    );
                    table.by_user.insert(user_id.to_owned(), instance_id.clone());
                    Plan::Create { instance_id, token_dir }
                }
            };

            match plan {
                Plan::Ready(info) => return Ok(info),
                Plan::Wait => {
                    if Instant::now() >= wait_deadline {
                        return Err(SupervisorError::Spawn(
                            "timed out waiting for concurrent worker startup".to_owned(),
                        ));
                    }
                    tokio::time::sleep(WAIT_POLL).await;
                }
                Plan::Replace(instance_id) => {
                    debug!(instance = %instance_id, user_id, "replacing failed worker");
                    // An errored process may still be holding its port; make
                    // sure it is gone before the port can be reallocated.
                    let pid = {
                        let table = self.lock();
                        table.workers.get(&instance_id).and_then(|entry| entry.pid)
                    };
                    if let Some(pid) = pid {
                        force_kill(pid);
                    }
                    self.remove_instance(&instance_id);
                }
                Plan::Create { instance_id, token_dir } => {
                    return self
                        .launch(instance_id, Some(user_id.to_owned()), token_dir)
                        .await;
                }
            }
        }
    }

    /// Snapshot of the default worker, if initialized.
    pub fn default_worker(&self) -> Option<WorkerInfo> {
        let table = self.lock();
        table
            .workers
            .get(DEFAULT_INSTANCE_ID)
            .map(|entry| entry.snapshot(DEFAULT_INSTANCE_ID))
    }

    /// Record request activity on a worker.
    pub fn touch(&self, instance_id: &str) {
        let mut table = self.lock();
        if let Some(entry) = table.workers.get_mut(instance_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Record a successful liveness probe.
    fn record_healthy(&self, instance_id: &str) {
        let mut table = self.lock();
        if let Some(entry) = table.workers.get_mut(instance_id) {
            entry.last_healthy = Some(Instant::now());
        }
    }

    /// Park a worker in the error state (transport failure, failed probe).
    /// The next routing attempt or reaper pass replaces it.
    pub fn mark_error(&self, instance_id: &str) {
        let mut table = self.lock();
        if let Some(entry) = table.workers.get_mut(instance_id) {
            if entry.status != WorkerStatus::Stopped {
                warn!(instance = %instance_id, prev = entry.status.as_str(), "worker marked as errored");
                entry.status = WorkerStatus::Error;
            }
        }
    }

    /// Begin stopping a worker: graceful signal now, forced kill after the
    /// grace period if it is still around.
    pub async fn stop(self: &Arc<Self>, instance_id: &str) {
        let pid = {
            let mut table = self.lock();
            let Some(entry) = table.workers.get_mut(instance_id) else {
                return;
            };
            if matches!(entry.status, WorkerStatus::Stopping | WorkerStatus::Stopped) {
                return;
            }
            entry.status = WorkerStatus::Stopping;
            entry.pid
        };

        debug!(instance = %instance_id, "stopping worker");
        if let Some(pid) = pid {
            terminate(pid);
        }

        let supervisor = Arc::clone(self);
        let instance_id = instance_id.to_owned();
        let grace = self.cfg.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let lingering = {
                let table = supervisor.lock();
                table
                    .workers
                    .get(&instance_id)
                    .is_some_and(|entry| entry.status == WorkerStatus::Stopping)
            };
            if lingering {
                warn!(instance = %instance_id, "worker ignored graceful stop, killing");
                if let Some(pid) = pid {
                    force_kill(pid);
                }
            }
        });
    }

    /// Probe a worker's health endpoint.
    pub async fn health(&self, instance_id: &str) -> bool {
        let port = {
            let table = self.lock();
            match table.workers.get(instance_id) {
                Some(entry) => entry.port,
                None => return false,
            }
        };
        self.probe_port(port).await
    }

    /// One liveness pass over all running workers. Successful probes count
    /// as activity; failures park the worker in `error`.
    pub async fn liveness_sweep(self: &Arc<Self>) {
        let running: Vec<(String, u16)> = {
            let table = self.lock();
            table
                .workers
                .iter()
                .filter(|(_, entry)| entry.status == WorkerStatus::Running)
                .map(|(id, entry)| (id.clone(), entry.port))
                .collect()
        };

        let probes = running.into_iter().map(|(instance_id, port)| {
            let supervisor = Arc::clone(self);
            async move {
                if supervisor.probe_port(port).await {
                    supervisor.record_healthy(&instance_id);
                } else {
                    warn!(instance = %instance_id, port, "liveness probe failed");
                    supervisor.mark_error(&instance_id);
                }
            }
        });
        futures::future::join_all(probes).await;
    }

    /// One idle-reaper pass: stop non-default workers whose last activity is
    /// older than the idle timeout.
    pub async fn reap_idle(self: &Arc<Self>) {
        let now = Instant::now();
        let idle: Vec<String> = {
            let table = self.lock();
            table
                .workers
                .iter()
                .filter(|(id, entry)| {
                    id.as_str() != DEFAULT_INSTANCE_ID
                        && matches!(entry.status, WorkerStatus::Running | WorkerStatus::Error)
                        && now.duration_since(entry.last_activity) > self.cfg.idle_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for instance_id in idle {
            info!(instance = %instance_id, "reaping idle worker");
            self.stop(&instance_id).await;
        }
    }

    /// Stop every worker, default last, and wait for the children to go.
    pub async fn shutdown(self: &Arc<Self>) {
        let user_instances: Vec<String> = {
            let table = self.lock();
            table
                .workers
                .keys()
                .filter(|id| id.as_str() != DEFAULT_INSTANCE_ID)
                .cloned()
                .collect()
        };

        info!(count = user_instances.len(), "stopping user workers");
        for instance_id in &user_instances {
            self.stop(instance_id).await;
        }
        self.await_drained(|table| table.user_instance_count() == 0)
            .await;

        self.stop(DEFAULT_INSTANCE_ID).await;
        self.await_drained(|table| {
            table
                .workers
                .get(DEFAULT_INSTANCE_ID)
                .is_none_or(|entry| entry.status == WorkerStatus::Stopped)
        })
        .await;
        info!("all workers stopped");
    }

    pub fn counters(&self) -> InstanceCounters {
        let table = self.lock();
        let running = table
            .workers
            .values()
            .filter(|entry| entry.status == WorkerStatus::Running)
            .count();
        let default_status = table
            .workers
            .get(DEFAULT_INSTANCE_ID)
            .map(|entry| entry.status.as_str().to_owned())
            .unwrap_or_else(|| "absent".to_owned());
        InstanceCounters {
            total_instances: table.workers.len(),
            user_instances: table.user_instance_count(),
            running_instances: running,
            default_instance_status: default_status,
        }
    }

    /// Current status of an instance, if tracked.
    pub fn status_of(&self, instance_id: &str) -> Option<WorkerStatus> {
        let table = self.lock();
        table.workers.get(instance_id).map(|entry| entry.status)
    }

    // ---- internals ----

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerTable> {
        self.table.lock().expect("worker table lock")
    }

    fn remove_instance(&self, instance_id: &str) {
        let mut table = self.lock();
        if let Some(entry) = table.workers.remove(instance_id) {
            if let Some(user_id) = entry.user_id {
                table.by_user.remove(&user_id);
            }
        }
    }

    /// Spawn the child for an already-inserted placeholder entry and wait
    /// for readiness. Cleans the placeholder up on failure.
    async fn launch(
        self: &Arc<Self>,
        instance_id: String,
        user_id: Option<String>,
        token_dir: PathBuf,
    ) -> Result<WorkerInfo, SupervisorError> {
        let port = match self.port_of(&instance_id) {
            Some(port) => port,
            None => return Err(SupervisorError::UnknownInstance(instance_id)),
        };

        if let Err(e) = tokio::fs::create_dir_all(&token_dir).await {
            self.remove_instance(&instance_id);
            return Err(SupervisorError::Spawn(format!(
                "cannot create token dir: {e}"
            )));
        }

        let mut command = Command::new(&self.cfg.worker_binary);
        command
            .arg("serve")
            .args(["--transport", "http"])
            .args(["--port", &port.to_string()])
            .args(["--app-id", &self.cfg.idp_app_id])
            .args(["--app-secret", &self.cfg.idp_app_secret])
            .arg("--token-dir")
            .arg(&token_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.remove_instance(&instance_id);
                return Err(SupervisorError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();
        info!(
            instance = %instance_id,
            user_id = user_id.as_deref().unwrap_or(DEFAULT_INSTANCE_ID),
            port,
            pid,
            "worker spawned"
        );

        {
            let mut table = self.lock();
            if let Some(entry) = table.workers.get_mut(&instance_id) {
                entry.pid = pid;
            }
        }

        if let Some(stderr) = child.stderr.take() {
            let log_id = instance_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance = %log_id, "{line}");
                }
            });
        }

        let supervisor = Arc::clone(self);
        let monitored = instance_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(instance = %monitored, code = ?status.code(), "worker exited"),
                Err(e) => warn!(instance = %monitored, error = %e, "failed to await worker exit"),
            }
            supervisor.on_exit(&monitored);
        });

        match self.wait_ready(&instance_id, port).await {
            Ok(()) => {
                let promoted = {
                    let mut table = self.lock();
                    match table.workers.get_mut(&instance_id) {
                        // The child may have died between the last probe and
                        // this lock; only a still-starting entry is promoted.
                        Some(entry) if entry.status == WorkerStatus::Starting => {
                            entry.status = WorkerStatus::Running;
                            entry.last_activity = Instant::now();
                            Some(entry.snapshot(&instance_id))
                        }
                        _ => None,
                    }
                };
                match promoted {
                    Some(info) => Ok(info),
                    None => {
                        self.remove_instance(&instance_id);
                        Err(SupervisorError::StartupExit)
                    }
                }
            }
            Err(e) => {
                if let Some(pid) = pid {
                    force_kill(pid);
                }
                self.remove_instance(&instance_id);
                Err(e)
            }
        }
    }

    /// Poll the worker's health endpoint until it answers, the child dies,
    /// or the window elapses. A live but unresponsive child is declared
    /// ready at the end of the window (best effort).
    async fn wait_ready(&self, instance_id: &str, port: u16) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.cfg.readiness_timeout;
        loop {
            match self.status_of(instance_id) {
                Some(WorkerStatus::Starting) => {}
                _ => return Err(SupervisorError::StartupExit),
            }

            if self.probe_port(port).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    instance = %instance_id,
                    port,
                    "readiness window elapsed with live child, declaring running"
                );
                return Ok(());
            }
            tokio::time::sleep(self.cfg.readiness_poll).await;
        }
    }

    async fn probe_port(&self, port: u16) -> bool {
        match self
            .probe
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn port_of(&self, instance_id: &str) -> Option<u16> {
        let table = self.lock();
        table.workers.get(instance_id).map(|entry| entry.port)
    }

    /// Child-exit handler: publishes the terminal state and drops
    /// bookkeeping for non-default workers. The default worker keeps its
    /// slot for the life of the gateway; a crash leaves it in `error`.
    fn on_exit(&self, instance_id: &str) {
        let mut table = self.lock();
        let Some(entry) = table.workers.get_mut(instance_id) else {
            return;
        };
        let next = match entry.status {
            WorkerStatus::Stopping => WorkerStatus::Stopped,
            WorkerStatus::Starting => WorkerStatus::Error,
            _ => WorkerStatus::Error,
        };

        if instance_id == DEFAULT_INSTANCE_ID {
            entry.status = next;
            entry.pid = None;
            if next == WorkerStatus::Error {
                warn!("default worker exited unexpectedly");
            }
            return;
        }

        if entry.status == WorkerStatus::Starting {
            // The launcher is mid-readiness-wait; leave the entry for it to
            // observe and tear down.
            entry.status = WorkerStatus::Error;
            entry.pid = None;
            return;
        }

        entry.status = next;
        let user_id = entry.user_id.clone();
        table.workers.remove(instance_id);
        if let Some(user_id) = user_id {
            table.by_user.remove(&user_id);
        }
    }

    async fn await_drained(&self, done: impl Fn(&WorkerTable) -> bool) {
        let deadline = Instant::now() + self.cfg.stop_grace + Duration::from_secs(2);
        loop {
            {
                let table = self.lock();
                if done(&table) {
                    return;
                }
            }
            if Instant::now() >= deadline {
                warn!("timed out waiting for workers to drain");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

fn new_entry(user_id: Option<String>, port: u16, token_dir: PathBuf) -> WorkerEntry {
    let now = Instant::now();
    WorkerEntry {
        user_id,
        port,
        status: WorkerStatus::Starting,
        created_at: now,
        last_activity: now,
        last_healthy: None,
        token_dir,
        pid: None,
    }
}

/// Ask a worker to terminate gracefully. ESRCH just means it is already
/// gone, so the result is ignored.
#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: kill with a valid signal constant has no memory-safety
    // concerns; the worst outcome is a stale pid hitting nothing.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

#[cfg(unix)]
fn force_kill(pid: u32) {
    // SAFETY: same as terminate.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) {}
