//! Parley Server - HTTP and WebSocket surface
//!
//! Routes:
//! - `GET /v1/chat.stream` - one streamed dialogue turn per WebSocket
//! - `POST /v1/memory/write`, `GET /v1/memory/top`, `GET /v1/memory/all/{npc_id}`
//! - `GET /healthz`, `GET /`

pub mod api;
pub mod config;
pub mod logging;
pub mod state;
pub mod ws;

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};

pub use config::ParleyConfig;
pub use state::AppState;

pub fn build_router(state: AppState) -> Router {
    // Game clients connect from arbitrary origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(api::health::root))
        .route("/healthz", get(api::health::healthz))
        .route("/v1/chat.stream", get(ws::chat::chat_stream))
        .nest("/v1/memory", api::memory::router())
        .layer(cors)
        .with_state(state)
}
