//! Request router: session → worker resolution and JSON-RPC forwarding.
//!
//! Bound sessions get their user's worker, lazily created; everything else
//! goes to the default worker. Failures on the forward path are normalized
//! into JSON-RPC internal-error envelopes so callers always get a response.

use crate::auth::broker::OauthBroker;
use crate::rpc;
use crate::session::SessionRegistry;
use crate::utils::body_fingerprint;
use crate::worker::supervisor::Supervisor;
use crate::worker::{WorkerInfo, WorkerStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

enum ForwardFailure {
    Transport(reqwest::Error),
    Protocol,
}

/// Routes JSON-RPC requests to workers and performs bootstrap introspection
/// against the default worker.
pub struct RequestRouter {
    supervisor: Arc<Supervisor>,
    sessions: Arc<SessionRegistry>,
    broker: Arc<OauthBroker>,
    forward: reqwest::Client,
}

impl RequestRouter {
    pub fn new(
        supervisor: Arc<Supervisor>,
        sessions: Arc<SessionRegistry>,
        broker: Arc<OauthBroker>,
        forward_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let forward = reqwest::Client::builder().timeout(forward_timeout).build()?;
        Ok(Self {
            supervisor,
            sessions,
            broker,
            forward,
        })
    }

    /// Forward a JSON-RPC request on behalf of a session. Always yields a
    /// response envelope; gateway-side failures become internal errors.
    pub async fn route(&self, session_id: &str, body: Value) -> Value {
        let request_id = rpc::request_id(&body);
        let method = body
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_owned();

        let user_id = self.sessions.user_of(session_id);
        let worker = match &user_id {
            // A bound user without usable credentials falls through to the
            // default worker; spawning a per-user worker would be pointless.
            Some(user_id) => match self.broker.ensure_valid(user_id).await {
                Some(_) => match self.supervisor.get_or_create(user_id).await {
                    Ok(worker) => Some(worker),
                    Err(e) => {
                        warn!(user_id, error = %e, "user worker unavailable, falling back to default");
                        self.supervisor.default_worker()
                    }
                },
                None => {
                    debug!(user_id, "no valid credentials, routing to default worker");
                    self.supervisor.default_worker()
                }
            },
            None => self.supervisor.default_worker(),
        };

        let Some(worker) = worker else {
            return rpc::internal_error(request_id, "No available worker", None);
        };
        if worker.status != WorkerStatus::Running {
            return rpc::internal_error(
                request_id,
                "No available worker",
                Some(json!({ "status": worker.status.as_str() })),
            );
        }

        debug!(
            session_id,
            instance = %worker.instance_id,
            method,
            fingerprint = body_fingerprint(body.to_string().as_bytes()),
            "forwarding request"
        );
        self.supervisor.touch(&worker.instance_id);

        match self.forward_to(&worker, &body).await {
            Ok(response) => response,
            Err(ForwardFailure::Transport(e)) => {
                warn!(instance = %worker.instance_id, error = %e, "worker transport failure");
                self.supervisor.mark_error(&worker.instance_id);
                rpc::internal_error(request_id, "worker transport error", None)
            }
            Err(ForwardFailure::Protocol) => {
                warn!(instance = %worker.instance_id, "worker returned a non-JSON-RPC body");
                rpc::internal_error(request_id, "invalid response", None)
            }
        }
    }

    /// Tool list for stream bootstrap. Any failure yields the documented
    /// fallback list so clients can proceed without a healthy worker.
    pub async fn bootstrap_tools(&self) -> Value {
        match self.call_default("tools/list", None).await {
            Some(result) => match result.get("tools") {
                Some(tools) if tools.is_array() => tools.clone(),
                _ => fallback_tools(),
            },
            None => {
                debug!("default worker introspection failed, using fallback tool list");
                fallback_tools()
            }
        }
    }

    /// Capability object for stream bootstrap, with a fixed fallback.
    pub async fn bootstrap_capabilities(&self) -> Value {
        match self
            .call_default(
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await
        {
            Some(result) => result,
            None => {
                debug!("default worker initialize failed, using fallback capabilities");
                fallback_capabilities()
            }
        }
    }

    /// Issue a gateway-originated call against the default worker, returning
    /// its `result` member.
    async fn call_default(&self, method: &str, params: Option<Value>) -> Option<Value> {
        let worker = self.supervisor.default_worker()?;
        if worker.status != WorkerStatus::Running {
            return None;
        }
        let request = rpc::request(1, method, params);
        let response = self.forward_to(&worker, &request).await.ok()?;
        response.get("result").cloned()
    }

    async fn forward_to(&self, worker: &WorkerInfo, body: &Value) -> Result<Value, ForwardFailure> {
        let response = self
            .forward
            .post(format!("{}/messages", worker.base_url()))
            .json(body)
            .send()
            .await
            .map_err(ForwardFailure::Transport)?;
        let value: Value = response
            .json()
            .await
            .map_err(ForwardFailure::Transport)?;
        if !rpc::is_valid_response(&value) {
            return Err(ForwardFailure::Protocol);
        }
        Ok(value)
    }
}

/// Documented capabilities of the worker, served when the default worker
/// cannot answer `tools/list` itself.
fn fallback_tools() -> Value {
    json!([
        {
            "name": "messages/send",
            "description": "Send a message through the connected workspace account",
        },
        {
            "name": "documents/search",
            "description": "Search documents visible to the connected workspace account",
        },
    ])
}

fn fallback_capabilities() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": { "listChanged": false },
        },
        "serverInfo": {
            "name": "worker",
            "version": "unknown",
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tools_is_a_nonempty_list() {
        let tools = fallback_tools();
        assert!(tools.is_array());
        assert!(!tools.as_array().unwrap().is_empty());
        for tool in tools.as_array().unwrap() {
            assert!(tool.get("name").is_some());
        }
    }

    #[test]
    fn fallback_capabilities_names_the_protocol() {
        let caps = fallback_capabilities();
        assert!(caps.get("protocolVersion").is_some());
        assert!(caps["capabilities"].is_object());
    }
}
