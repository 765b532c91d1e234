//! Memory inspection and seeding endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use parley_traits::{MemoryEntry, NewMemory, PartitionKey};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::api::ApiError;
use crate::state::AppState;

const MAX_LIST_LIMIT: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/write", post(write_memory))
        .route("/top", get(top_memories))
        .route("/all/{npc_id}", get(all_memories))
}

/// Memory entry in the wire naming used by game clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct MemoryView {
    pub id: String,
    pub npc_id: String,
    pub player_id: String,
    pub text: String,
    pub salience: u8,
    pub private: bool,
    pub keys: Vec<String>,
    pub ts: i64,
}

impl From<MemoryEntry> for MemoryView {
    fn from(entry: MemoryEntry) -> Self {
        Self {
            id: entry.id,
            npc_id: entry.subject,
            player_id: entry.counterpart,
            text: entry.text,
            salience: entry.salience,
            private: entry.private,
            keys: entry.keys,
            ts: entry.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WriteMemoryRequest {
    pub npc_id: String,
    pub player_id: String,
    pub text: String,
    pub salience: u8,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_private")]
    pub private: bool,
    /// Optional proposed timestamp (ms); bumped forward when stale
    #[serde(default)]
    pub ts: Option<i64>,
}

fn default_private() -> bool {
    true
}

async fn write_memory(
    State(state): State<AppState>,
    Json(request): Json<WriteMemoryRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let partition = PartitionKey::new(request.npc_id, request.player_id);
    let mut memory = NewMemory::new(&partition, request.text, request.salience)
        .with_keys(request.keys)
        .with_private(request.private);
    if let Some(ts) = request.ts {
        memory = memory.with_timestamp(ts);
    }

    let entry = state.memory.write(memory).await?;
    info!(id = %entry.id, subject = %entry.subject, "Memory written");
    Ok((StatusCode::CREATED, Json(json!({ "ok": true, "id": entry.id }))))
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub npc_id: String,
    pub player_id: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub min_salience: u8,
}

fn default_k() -> usize {
    3
}

async fn top_memories(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Value>, ApiError> {
    let partition = PartitionKey::new(query.npc_id, query.player_id);
    let memories: Vec<MemoryView> = state
        .memory
        .top(&partition, query.k, query.min_salience)
        .await?
        .into_iter()
        .map(MemoryView::from)
        .collect();
    Ok(Json(json!({ "memories": memories })))
}

#[derive(Debug, Deserialize)]
pub struct AllQuery {
    pub player_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn all_memories(
    State(state): State<AppState>,
    Path(npc_id): Path<String>,
    Query(query): Query<AllQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.limit == 0 || query.limit > MAX_LIST_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    let memories: Vec<MemoryView> = state
        .memory
        .list_for_subject(&npc_id, query.player_id.as_deref(), query.limit)
        .await?
        .into_iter()
        .map(MemoryView::from)
        .collect();
    Ok(Json(json!({
        "npc_id": npc_id,
        "count": memories.len(),
        "memories": memories,
    })))
}
