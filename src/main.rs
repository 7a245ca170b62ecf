use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

use unigate::app::App;
use unigate::cli::Args;
use unigate::config::Config;
use unigate::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Configuration problems surface before logging is up; write them to
    // stderr directly.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    setup_logging(&config, args.tracing);

    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = env!("GIT_COMMIT_SHORT"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting unigate"
    );

    let mut app = match App::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = ?e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    app.start_services();
    app.run().await
}
