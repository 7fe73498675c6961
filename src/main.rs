//! Binary entry point: loads configuration, opens the store, and either
//! dispatches a `run`/`search` subcommand or serves the HTTP API (§6.2).

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use transcriptor::cli::{Cli, Command};
use transcriptor::config::RunConfig;
use transcriptor::db::Store;
use transcriptor::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcriptor=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = RunConfig::load()?;
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::create_dir_all(&config.data_dir).await.ok();

    let store = Store::open(&config.db_path).await?;
    tracing::info!(db_path = %config.db_path.display(), "database opened");

    let cli = Cli::parse();
    match cli.command {
        Some(Command::Serve) | None => serve(config, store).await,
        Some(command) => {
            let code = transcriptor::cli::dispatch(command, &config, store).await;
            std::process::exit(code);
        }
    }
}

async fn serve(config: RunConfig, store: Store) -> anyhow::Result<()> {
    let host = config.host.clone();
    let port = config.port;
    let state = AppState::new(config, store);

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::HEAD,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE]);

    let app = api::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
