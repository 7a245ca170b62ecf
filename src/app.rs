use crate::auth::broker::OauthBroker;
use crate::auth::sealed::SealKey;
use crate::auth::store::TokenStore;
use crate::config::Config;
use crate::idp::IdpClient;
use crate::router::RequestRouter;
use crate::services::manager::ServiceManager;
use crate::services::supervisor::SupervisorService;
use crate::services::web::WebService;
use crate::session::SessionRegistry;
use crate::signals::handle_shutdown_signals;
use crate::state::AppState;
use crate::web::rate_limit::RequestRateLimiter;
use crate::worker::supervisor::{Supervisor, SupervisorConfig};
use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Main application struct containing all wired components
pub struct App {
    config: Arc<Config>,
    service_manager: ServiceManager,
}

impl App {
    /// Construct every component and bring up the default worker. Errors
    /// here are startup failures (exit code 1).
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let config = Arc::new(config);

        let seal = SealKey::load_or_generate(
            config.token_seal_key.as_deref(),
            &config.data_dir.join("seal.key"),
        )
        .context("failed to initialize token sealing")?;
        let store = Arc::new(TokenStore::new(
            config.data_dir.clone(),
            seal,
            config.token_cache_ttl,
        ));

        let idp = Arc::new(
            IdpClient::new(
                config.idp_base_url.clone(),
                config.idp_app_id.clone(),
                config.idp_app_secret.clone(),
                config.idp_redirect_uri.clone(),
            )
            .context("failed to build identity provider client")?,
        );
        let broker = Arc::new(OauthBroker::new(idp, store));

        let sessions = Arc::new(SessionRegistry::new(config.max_sessions, config.session_ttl));

        let supervisor = Supervisor::new(SupervisorConfig::from_config(&config))
            .context("failed to build worker supervisor")?;
        supervisor
            .initialize()
            .await
            .context("failed to start the default worker")?;

        let router = Arc::new(
            RequestRouter::new(
                supervisor.clone(),
                sessions.clone(),
                broker.clone(),
                config.forward_timeout,
            )
            .context("failed to build request router")?,
        );
        let limiter = Arc::new(RequestRateLimiter::new(
            config.rate_limit_max_requests,
            config.rate_limit_window,
            config.rate_limit_burst,
        ));

        let state = AppState {
            config: config.clone(),
            sessions,
            supervisor,
            broker,
            router,
            limiter,
            started_at: Instant::now(),
        };

        let mut service_manager = ServiceManager::new();
        service_manager.register_service("web", Box::new(WebService::new(state.clone())));
        service_manager
            .register_service("supervisor", Box::new(SupervisorService::new(state.clone())));

        info!(
            data_dir = %config.data_dir.display(),
            max_instances = config.max_instances,
            "gateway components initialized"
        );

        Ok(App {
            config,
            service_manager,
        })
    }

    /// Start all registered services
    pub fn start_services(&mut self) {
        self.service_manager.spawn_all();
    }

    /// Run the application and handle shutdown signals
    pub async fn run(self) -> ExitCode {
        handle_shutdown_signals(self.service_manager, self.config.shutdown_timeout).await
    }
}
