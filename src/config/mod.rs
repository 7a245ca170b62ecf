//! Configuration for the gateway.
//!
//! All settings are loaded from environment variables via figment. Durations
//! accept both numeric values (interpreted as seconds) and strings with units
//! ("500ms", "30s", "5m", "24h").

use figment::{Figment, providers::Env};
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

/// Main gateway configuration.
///
/// The three `idp_*` credential fields are mandatory; everything else has a
/// default. See [`Config::validate`] for the startup checks.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for this application's target ("trace" through "error").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port for the gateway's own HTTP listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bind address for the HTTP listener.
    #[serde(default = "default_host")]
    pub host: String,
    /// Externally visible base URL, used when building the reply endpoint and
    /// OAuth redirect targets. Defaults to `http://localhost:{port}`.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Identity provider application id.
    pub idp_app_id: String,
    /// Identity provider application secret.
    pub idp_app_secret: String,
    /// Redirect URI registered with the identity provider.
    pub idp_redirect_uri: String,
    /// Identity provider API base URL.
    #[serde(default = "default_idp_base_url")]
    pub idp_base_url: String,

    /// Path to the worker binary spawned per user.
    #[serde(default = "default_worker_binary")]
    pub worker_binary: String,
    /// First port handed to user-bound workers.
    #[serde(default = "default_worker_base_port")]
    pub worker_base_port: u16,
    /// Port of the always-on default worker.
    #[serde(default = "default_worker_default_port")]
    pub worker_default_port: u16,
    /// Number of ports available above `worker_base_port`.
    #[serde(default = "default_worker_port_window")]
    pub worker_port_window: u16,
    /// Maximum number of user-bound workers alive at once.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Inactivity threshold after which a user worker is reaped.
    #[serde(default = "default_idle_timeout", deserialize_with = "duration")]
    pub idle_timeout: Duration,

    /// Maximum number of tracked sessions (LRU-bounded).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle lifetime of a session binding.
    #[serde(default = "default_session_ttl", deserialize_with = "duration")]
    pub session_ttl: Duration,

    /// Allowed requests per window per session (or per IP for anonymous callers).
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,
    /// Window over which the request budget applies.
    #[serde(default = "default_rate_limit_window", deserialize_with = "duration")]
    pub rate_limit_window: Duration,
    /// Extra requests allowed in short bursts.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Root directory for per-user token directories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// How long loaded credentials stay cached before disk is re-read.
    #[serde(default = "default_token_cache_ttl", deserialize_with = "duration")]
    pub token_cache_ttl: Duration,
    /// Hex-encoded 32-byte key sealing refresh tokens at rest. Generated and
    /// persisted under the data directory when unset.
    #[serde(default)]
    pub token_seal_key: Option<String>,

    /// Total time allowed for a freshly spawned worker to become ready.
    #[serde(default = "default_readiness_timeout", deserialize_with = "duration")]
    pub readiness_timeout: Duration,
    /// Interval between readiness probes during the wait.
    #[serde(default = "default_readiness_poll", deserialize_with = "duration")]
    pub readiness_poll: Duration,
    /// Interval between liveness sweeps over running workers.
    #[serde(default = "default_liveness_interval", deserialize_with = "duration")]
    pub liveness_interval: Duration,
    /// Interval between idle-reaper passes.
    #[serde(default = "default_reap_interval", deserialize_with = "duration")]
    pub reap_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping a worker.
    #[serde(default = "default_stop_grace", deserialize_with = "duration")]
    pub stop_grace: Duration,

    /// Timeout for forwarding a JSON-RPC request to a worker.
    #[serde(default = "default_forward_timeout", deserialize_with = "duration")]
    pub forward_timeout: Duration,
    /// Soft timeout for the event-stream bootstrap subcalls.
    #[serde(default = "default_bootstrap_timeout", deserialize_with = "duration")]
    pub bootstrap_timeout: Duration,

    /// Resident-set ceiling for the gateway process; exceeding it flips the
    /// health endpoint to unhealthy.
    #[serde(default = "default_memory_cap_mb")]
    pub memory_cap_mb: u64,
    /// Cadence of the periodic state-snapshot log line.
    #[serde(default = "default_snapshot_interval", deserialize_with = "duration")]
    pub snapshot_interval: Duration,

    /// Graceful shutdown timeout for the whole process.
    #[serde(default = "default_shutdown_timeout", deserialize_with = "duration")]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new().merge(Env::raw()).extract()
    }

    /// Startup validation. Failures here are fatal (exit code 1).
    pub fn validate(&self) -> Result<(), String> {
        if self.idp_app_id.trim().is_empty() {
            return Err("IDP_APP_ID must not be empty".into());
        }
        if self.idp_app_secret.trim().is_empty() {
            return Err("IDP_APP_SECRET must not be empty".into());
        }
        if !self.idp_redirect_uri.starts_with("http") {
            return Err(format!(
                "IDP_REDIRECT_URI must start with 'http', got '{}'",
                self.idp_redirect_uri
            ));
        }
        if self.worker_default_port == self.port {
            return Err("WORKER_DEFAULT_PORT must differ from the gateway PORT".into());
        }
        if self.worker_base_port == self.port {
            return Err("WORKER_BASE_PORT must differ from the gateway PORT".into());
        }
        let window_end = self.worker_base_port as u32 + self.worker_port_window as u32;
        if (self.worker_default_port as u32) >= self.worker_base_port as u32
            && (self.worker_default_port as u32) < window_end
        {
            return Err("WORKER_DEFAULT_PORT must lie outside the allocator window".into());
        }
        if self.worker_port_window == 0 {
            return Err("WORKER_PORT_WINDOW must be at least 1".into());
        }
        if self.max_instances == 0 {
            return Err("MAX_INSTANCES must be at least 1".into());
        }
        Ok(())
    }

    /// Externally visible base URL, trailing slash stripped.
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(base) => base.trim_end_matches('/').to_owned(),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_idp_base_url() -> String {
    "https://open.larkoffice.com/open-apis".to_string()
}

/// Resolved via PATH in development; deployments set an absolute path.
fn default_worker_binary() -> String {
    "mock-worker".to_string()
}

fn default_worker_base_port() -> u16 {
    3100
}

fn default_worker_default_port() -> u16 {
    3099
}

fn default_worker_port_window() -> u16 {
    1000
}

fn default_max_instances() -> usize {
    20
}

/// Default idle timeout of 30 minutes
fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_sessions() -> usize {
    1000
}

/// Default session idle lifetime of 24 hours
fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_rate_limit_max_requests() -> u32 {
    120
}

/// Default rate-limit window of one minute
fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit_burst() -> u32 {
    30
}

fn default_memory_cap_mb() -> u64 {
    1024
}

/// Default snapshot cadence of 5 minutes
fn default_snapshot_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Default token cache TTL of 5 minutes
fn default_token_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_readiness_poll() -> Duration {
    Duration::from_secs(2)
}

fn default_liveness_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_reap_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_forward_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bootstrap_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

/// Duration parser with seconds as the default unit.
///
/// Supports milliseconds through hours, allows whitespace between the number
/// and the unit, and sums multiple units ("1m 30s" = 90 seconds).
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Deserialize a duration from either a bare number (seconds) or a string
/// with units.
fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration '{}': {}. Examples: '5' (seconds), '1500ms', '30s', '5m', '24h'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
