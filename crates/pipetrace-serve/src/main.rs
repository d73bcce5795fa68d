//! Pipetrace Serve - HTTP API server for pipeline event tracking.
//!
//! This binary starts the API server that accepts pipeline events and
//! answers aggregate queries against the ClickHouse event store.

use axum::http::Request;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pipetrace_core::metrics::{init_metrics, start_metrics_server};
use pipetrace_serve::{router, AppState, Config};

/// Pipetrace API server.
#[derive(Parser, Debug)]
#[command(name = "pipetrace-serve")]
#[command(about = "HTTP API server for pipeline event tracking", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.bind_addr.clone();
    let metrics_port = config.metrics_port;

    let metrics_handle = init_metrics();
    if metrics_port != 0 {
        start_metrics_server(metrics_port, metrics_handle).await?;
    }

    let state = AppState::new(config)?;

    // Idempotent DDL; safe on every boot.
    state.store.ensure_schema().await?;

    let app = router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    query = request.uri().query().unwrap_or("")
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(listener, app).await?;

    Ok(())
}
