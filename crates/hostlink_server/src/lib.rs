//! # hostlink server
//!
//! Axum front end for the hostlink relay: the device WebSocket at `/ws` (and
//! `/`), the token-protected file API under `/api`, and a health probe.
//! All relay state lives in the [`hostlink_core::MessageRouter`] task; this
//! crate only moves frames and bytes.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;

use auth::{TOKEN_HEADER, TokenAuth};
use axum::{
    Extension, Json, Router,
    http::{HeaderName, Method, header},
    routing::get,
};
use config::Config;
use handlers::{api::ApiState, api_routes, ws::WsState, ws_handler};
use hostlink_core::{RouterHandle, Sandbox};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

/// Assemble the full HTTP application.
pub fn build_app(config: &Config, relay: RouterHandle, sandbox: Arc<Sandbox>) -> Router {
    let ws_state = WsState {
        relay: relay.clone(),
        heartbeat: config.heartbeat_interval,
    };
    let api_state = ApiState {
        sandbox,
        relay,
        max_file_size: config.max_file_size,
    };

    // Build CORS layer
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(TOKEN_HEADER)])
        .allow_origin(AllowOrigin::list(origins));

    let websocket = Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(ws_state);

    Router::new()
        .route("/health", get(|| async { Json(json!({ "ok": true })) }))
        .nest("/api", api_routes(api_state))
        .merge(websocket)
        .layer(Extension(TokenAuth::new(&config.token)))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
