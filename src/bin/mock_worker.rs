//! Stub single-user worker for development and the integration test suite.
//!
//! Speaks the worker protocol the gateway assumes: `GET /health` for
//! readiness/liveness and `POST /messages` for JSON-RPC. It answers
//! `tools/list` and `initialize` with canned payloads and echoes every other
//! method. `debug/exit` terminates the process, which lets tests exercise
//! crash handling without reaching for the pid.

use axum::extract::Json;
use axum::response::Json as JsonResponse;
use axum::routing::{get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stub tool-server worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker's HTTP endpoint
    Serve {
        /// Transport to expose (only "http" is supported)
        #[arg(long, default_value = "http")]
        transport: String,
        #[arg(long)]
        port: u16,
        /// Identity provider app id (unused by the stub)
        #[arg(long, default_value = "")]
        app_id: String,
        /// Identity provider app secret (unused by the stub)
        #[arg(long, default_value = "")]
        app_secret: String,
        /// Directory holding this user's credentials
        #[arg(long)]
        token_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let Command::Serve {
        transport,
        port,
        token_dir,
        ..
    } = args.command;

    anyhow::ensure!(transport == "http", "unsupported transport: {transport}");
    tokio::fs::create_dir_all(&token_dir).await?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/messages", post(messages));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    eprintln!("mock worker listening on {addr}, token dir {}", token_dir.display());
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> JsonResponse<Value> {
    JsonResponse(json!({ "status": "ok" }))
}

async fn messages(Json(request): Json<Value>) -> JsonResponse<Value> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");

    let result = match method {
        "tools/list" => json!({
            "tools": [
                {
                    "name": "messages/send",
                    "description": "Send a message through the connected workspace account",
                },
                {
                    "name": "documents/search",
                    "description": "Search documents visible to the connected workspace account",
                },
                {
                    "name": "calendar/list",
                    "description": "List upcoming events on the connected calendar",
                },
            ],
        }),
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": "mock-worker", "version": env!("CARGO_PKG_VERSION") },
        }),
        "debug/exit" => {
            // Reply first, then die, so the caller sees a clean response.
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::process::exit(1);
            });
            json!({ "exiting": true })
        }
        other => json!({ "echo": other, "params": request.get("params") }),
    };

    JsonResponse(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}
