//! Worker processes and their supervision.
//!
//! A worker is a single-user tool-server child process reached over loopback
//! HTTP. The supervisor owns the worker table; everything else sees workers
//! only through [`WorkerInfo`] snapshots.

pub mod ports;
pub mod supervisor;

use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

/// Instance id of the always-on worker serving unauthenticated sessions.
pub const DEFAULT_INSTANCE_ID: &str = "default";

/// Lifecycle states of a worker process.
///
/// Transitions: starting → running → stopping → stopped, with `error`
/// reachable from starting/running (probe failure, unexpected exit) and
/// resolving to `stopped` once the process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        }
    }
}

/// Point-in-time snapshot of a worker, handed out of the supervisor lock.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub instance_id: String,
    /// None for the default worker.
    pub user_id: Option<String>,
    pub port: u16,
    pub status: WorkerStatus,
    pub created_at: Instant,
    /// Last forwarded request; drives the idle reaper.
    pub last_activity: Instant,
    /// Last successful liveness probe, if any.
    pub last_healthy: Option<Instant>,
    pub token_dir: PathBuf,
}

impl WorkerInfo {
    /// Loopback base URL of the worker's HTTP endpoint.
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Aggregate instance counters surfaced on the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCounters {
    pub total_instances: usize,
    pub user_instances: usize,
    pub running_instances: usize,
    pub default_instance_status: String,
}
