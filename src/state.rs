//! Application state shared across the HTTP surface and background services.
//!
//! Every component is an ordinary value constructed at startup; there is no
//! process-wide state beyond this root object.

use crate::auth::broker::OauthBroker;
use crate::config::Config;
use crate::router::RequestRouter;
use crate::session::SessionRegistry;
use crate::web::rate_limit::RequestRateLimiter;
use crate::worker::supervisor::Supervisor;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub broker: Arc<OauthBroker>,
    pub router: Arc<RequestRouter>,
    pub limiter: Arc<RequestRateLimiter>,
    pub started_at: Instant,
}
