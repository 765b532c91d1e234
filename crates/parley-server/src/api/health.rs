use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::ApiError;
use crate::state::AppState;

const SERVICE: &str = "parley";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct Health {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub model: String,
    pub memory_count: u64,
}

pub async fn healthz(State(state): State<AppState>) -> Result<Json<Health>, ApiError> {
    let memory_count = state.memory.count(None).await?;
    Ok(Json(Health {
        ok: true,
        service: SERVICE,
        version: VERSION,
        model: state.model.clone(),
        memory_count,
    }))
}

pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "parley - NPC dialogue service",
        "version": VERSION,
        "health": "/healthz",
        "chat": "/v1/chat.stream",
    }))
}
