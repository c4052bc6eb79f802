use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use kinpoint_core::AppState;
use kinpoint_db::Repository;
use kinpoint_kv::KvClient;
use kinpoint_ws::BusDispatcher;
use serde_json::json;
use std::io::IsTerminal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    let ansi_default = if cfg!(windows) {
        false
    } else {
        std::io::stderr().is_terminal()
    };
    let default_log_filter = "kinpoint_server=info,kinpoint_ws=info,kinpoint_core=info,\
                              kinpoint_kv=info,kinpoint_db=info,tower_http=info,axum=warn";
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_ansi(ansi_default)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_filter)),
        )
        .init();

    let args = cli::Args::parse();
    let mut app_config = config::from_env();
    if let Some(bind) = args.bind {
        app_config.bind_address = bind;
    }
    if let Some(port) = args.port {
        app_config.port = port;
    }

    // Readiness gates on all three KV connections answering a ping.
    let kv = KvClient::connect(&app_config.redis_url)
        .await
        .context("kv backend unavailable")?;
    let repo = Repository::new(&app_config.repository)
        .context("repository client construction failed")?;
    if !repo.configured() {
        tracing::warn!("running without a repository; membership reads will be empty");
    }

    let state = AppState::assemble(app_config, kv, repo);

    BusDispatcher::start(&state)
        .await
        .context("bus dispatcher startup failed")?;

    let app = Router::new()
        .merge(kinpoint_ws::gateway_router())
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.bind_address, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "kinpoint gateway listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, closing sessions");
            shutdown.notify_waiters();
        })
        .await
        .context("server error")?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let kv = match state.kv.ping().await {
        Ok(()) => "ok",
        Err(err) => {
            tracing::warn!(%err, "health ping failed");
            "down"
        }
    };
    Json(json!({
        "status": "ok",
        "kv": kv,
        "repository_configured": state.repo.configured(),
    }))
}
