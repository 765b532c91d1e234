use anyhow::{Context, Result};
use parley_ai::{GeminiAdapter, ScriptedAdapter};
use parley_core::{RedbMemoryStore, TurnOrchestrator};
use parley_storage::Storage;
use parley_traits::GenerationAdapter;
use std::sync::Arc;
use tracing::info;

use crate::config::{GenerationSection, ParleyConfig, Provider};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TurnOrchestrator>,
    pub memory: Arc<RedbMemoryStore>,
    pub config: Arc<ParleyConfig>,
    /// Model name reported by the health check
    pub model: String,
}

impl AppState {
    pub fn new(
        config: ParleyConfig,
        memory: Arc<RedbMemoryStore>,
        adapter: Arc<dyn GenerationAdapter>,
        model: impl Into<String>,
    ) -> Self {
        let orchestrator = TurnOrchestrator::new(memory.clone(), adapter)
            .with_policy(config.turn.policy())
            .with_sampling(config.generation.sampling());
        Self {
            orchestrator: Arc::new(orchestrator),
            memory,
            config: Arc::new(config),
            model: model.into(),
        }
    }

    /// Open the database and build the configured adapter.
    pub fn from_config(config: ParleyConfig) -> Result<Self> {
        let db_path = config.storage.resolve_db_path()?;
        let storage = Storage::new(&db_path)
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;
        info!(path = %db_path.display(), "Memory store opened");

        let memory = Arc::new(RedbMemoryStore::from_storage(storage.memory.clone()));
        let (adapter, model) = build_adapter(&config.generation)?;
        info!(provider = %config.generation.provider, model = %model, "Generation adapter ready");

        Ok(Self::new(config, memory, adapter, model))
    }
}

pub fn build_adapter(
    generation: &GenerationSection,
) -> Result<(Arc<dyn GenerationAdapter>, String)> {
    match generation.provider {
        Provider::Gemini => {
            let api_key = generation.api_key.clone().unwrap_or_default();
            let mut adapter = GeminiAdapter::new(api_key)?.with_model(generation.model.clone());
            if let Some(base_url) = &generation.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            let model = adapter.model().to_string();
            Ok((Arc::new(adapter), model))
        }
        Provider::Scripted => {
            let adapter = ScriptedAdapter::new();
            let model = adapter.name().to_string();
            Ok((Arc::new(adapter), model))
        }
    }
}
