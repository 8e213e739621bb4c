mod auth;
mod broadcaster;
mod config;
mod decoder;
mod geo;
mod handlers;
mod history;
mod mqtt_hub;
mod persistence;
mod reaper;
mod state;
mod topology;

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderValue;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::decoder::{NodeDecoder, PayloadDecoder};
use crate::handlers::ApiCtx;
use crate::mqtt_hub::IngestCtx;
use crate::state::{AppState, Clients, SharedState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshmap_backend=info,rumqttc=warn".into()),
        )
        .init();

    let cfg = Arc::new(Config::from_env());
    info!(
        "meshmap backend v{} starting — broker {}:{}",
        env!("CARGO_PKG_VERSION"),
        cfg.mqtt_host,
        cfg.mqtt_port
    );

    // Load persisted state, history and overrides before anything moves.
    let mut app_state = AppState::new();
    persistence::load_state(&mut app_state, &cfg).await;
    history::load_journal(&mut app_state.history, &cfg).await;
    persistence::load_neighbor_overrides(&mut app_state, &cfg).await;
    let state: SharedState = Arc::new(RwLock::new(app_state));
    let clients: Clients = Arc::new(RwLock::new(HashMap::new()));

    // External decoder probe latches ready/unavailable for the process.
    let node = NodeDecoder::new(&cfg);
    node.probe().await;

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    // Broker ingest feeds the queue; the broadcaster is the single writer.
    let ingest = Arc::new(IngestCtx {
        state: state.clone(),
        cfg: cfg.clone(),
        decoder: PayloadDecoder::new(cfg.clone(), node.clone()),
        tx: event_tx,
    });
    tokio::spawn(mqtt_hub::run(ingest));
    tokio::spawn(broadcaster::broadcaster(
        state.clone(),
        clients.clone(),
        cfg.clone(),
        event_rx,
    ));
    tokio::spawn(reaper::reaper(state.clone(), clients.clone(), cfg.clone()));
    tokio::spawn(persistence::state_saver(state.clone(), cfg.clone()));
    tokio::spawn(history::compactor_task(state.clone(), cfg.clone()));

    // CORS: explicit origins for local dev, `*` for open deployments.
    let cors = if cfg.cors_origins.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .cors_origins
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let api = ApiCtx {
        state,
        clients,
        cfg: cfg.clone(),
        node,
        started_at: geo::now(),
    };
    let app = handlers::router(api).layer(cors);

    let addr = format!("0.0.0.0:{}", cfg.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    axum::serve(listener, app)
        .await
        .expect("http server failed");
}
