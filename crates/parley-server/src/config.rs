//! Server configuration.
//!
//! Values come from a TOML file (`PARLEY_CONFIG`, else `parley.toml` in the
//! working directory when present), then environment overrides, then the
//! built-in defaults. A `.env` file is loaded before the environment is read.

use anyhow::{Context, Result, anyhow, bail};
use parley_core::TurnPolicy;
use parley_traits::{SamplingParams, ValidationError, describe};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "parley.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub generation: GenerationSection,
    pub turn: TurnSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Database file; defaults to `memory.redb` under the parley directory
    pub db_path: Option<PathBuf>,
}

impl StorageSection {
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => parley_storage::paths::default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gemini,
    Scripted,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gemini => f.write_str("gemini"),
            Provider::Scripted => f.write_str("scripted"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(Provider::Gemini),
            "scripted" => Ok(Provider::Scripted),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub provider: Provider,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSection {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            provider: Provider::default(),
            model: parley_ai::gemini::DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: None,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            max_output_tokens: sampling.max_output_tokens,
        }
    }
}

// Keeps the API key out of logs.
impl fmt::Debug for GenerationSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationSection")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

impl GenerationSection {
    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSection {
    /// Continue without memories when retrieval fails
    pub degrade_on_retrieval_failure: bool,
    /// Frames queued per client before token forwarding waits
    pub sink_buffer: usize,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            degrade_on_retrieval_failure: TurnPolicy::default().degrade_on_retrieval_failure,
            sink_buffer: 32,
        }
    }
}

impl TurnSection {
    pub fn policy(&self) -> TurnPolicy {
        TurnPolicy {
            degrade_on_retrieval_failure: self.degrade_on_retrieval_failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info,parley_server=debug".to_string(),
            json: false,
        }
    }
}

impl ParleyConfig {
    /// Load from file and process environment, then validate.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply overrides from `lookup`. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = var("PARLEY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PARLEY_PORT") {
            self.server.port = parse_var("PARLEY_PORT", &port)?;
        }
        if let Some(path) = var("PARLEY_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(path));
        }
        if let Some(provider) = var("PARLEY_PROVIDER") {
            self.generation.provider = parse_var("PARLEY_PROVIDER", &provider)?;
        }
        if let Some(model) = var("PARLEY_MODEL") {
            self.generation.model = model;
        }
        if let Some(key) = var("GEMINI_API_KEY") {
            self.generation.api_key = Some(key);
        }
        if let Some(flag) = var("PARLEY_DEGRADE_ON_RETRIEVAL_FAILURE") {
            self.turn.degrade_on_retrieval_failure =
                parse_bool("PARLEY_DEGRADE_ON_RETRIEVAL_FAILURE", &flag)?;
        }
        if let Some(level) = var("PARLEY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(flag) = var("PARLEY_LOG_JSON") {
            self.logging.json = parse_bool("PARLEY_LOG_JSON", &flag)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ValidationError::new("server.port", "must not be 0"));
        }
        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            errors.push(ValidationError::new(
                "generation.temperature",
                "must be between 0 and 2",
            ));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            errors.push(ValidationError::new(
                "generation.top_p",
                "must be greater than 0 and at most 1",
            ));
        }
        if generation.max_output_tokens == 0 {
            errors.push(ValidationError::new(
                "generation.max_output_tokens",
                "must be at least 1",
            ));
        }
        if generation.model.trim().is_empty() {
            errors.push(ValidationError::new("generation.model", "must not be blank"));
        }
        let has_key = generation
            .api_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty());
        if generation.provider == Provider::Gemini && !has_key {
            errors.push(ValidationError::new(
                "generation.api_key",
                "is required for the gemini provider (set GEMINI_API_KEY)",
            ));
        }
        if self.turn.sink_buffer == 0 {
            errors.push(ValidationError::new("turn.sink_buffer", "must be at least 1"));
        }

        if !errors.is_empty() {
            bail!("invalid configuration: {}", describe(&errors));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return Some(PathBuf::from(path));
    }
    let default = Path::new(DEFAULT_CONFIG_FILE);
    default.exists().then(|| default.to_path_buf())
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {key}={value}: {err}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("invalid {key}={value}: expected a boolean"),
    }
}
