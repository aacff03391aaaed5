use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default bucket caps and thresholds for the tiered fact store.
pub const CURATED_FACTS_CAP: usize = 100;
pub const DAILY_FACTS_CAP: usize = 200;
pub const CURATED_IMPORTANCE_THRESHOLD: f64 = 0.8;
pub const SENSITIVE_IMPORTANCE_FLOOR: f64 = 0.85;
/// Cosine similarity above which a new fact is rejected as a duplicate.
pub const FACT_DUP_SIMILARITY: f64 = 0.90;
/// Accepted embedding dimensions.
pub const EMBEDDING_DIMS: [usize; 2] = [768, 3072];

/// Top-level config (scoop.toml + SCOOP_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoopConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Default for ScoopConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            models: ModelsConfig::default(),
            inference: InferenceConfig::default(),
            engine: EngineConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS origin list; "*" for development.
    #[serde(default = "default_origins")]
    pub allowed_origins: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            allowed_origins: default_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// The three-model hierarchy plus the embedding model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_primary_model")]
    pub primary: String,
    #[serde(default = "default_extended_model")]
    pub extended: String,
    #[serde(default = "default_fallback_model")]
    pub fallback: String,
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_model(),
            extended: default_extended_model(),
            fallback: default_fallback_model(),
            embedding: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: usize,
    #[serde(default = "default_window_secs")]
    pub circuit_failure_window_secs: u64,
    #[serde(default = "default_recovery_secs")]
    pub circuit_recovery_secs: u64,
    /// Token count at which routing prefers the extended-context model.
    /// Sits at 75% of the smallest supported model's declared context.
    #[serde(default = "default_extended_threshold")]
    pub extended_context_threshold: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            circuit_failure_threshold: default_failure_threshold(),
            circuit_failure_window_secs: default_window_secs(),
            circuit_recovery_secs: default_recovery_secs(),
            extended_context_threshold: default_extended_threshold(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,
    #[serde(default = "default_max_unique_queries")]
    pub max_unique_queries: usize,
    #[serde(default = "bool_true")]
    pub enable_retry: bool,
    /// Thinking-UI strategy: "none", "simple_loader", or "native".
    #[serde(default = "default_thinking")]
    pub thinking: String,
    /// Pause between simple-loader thinking emissions.
    #[serde(default = "default_thinking_delay")]
    pub thinking_delay_ms: u64,
    #[serde(default = "bool_true")]
    pub search_first: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            round_timeout_secs: default_round_timeout(),
            max_unique_queries: default_max_unique_queries(),
            enable_retry: true,
            thinking: default_thinking(),
            thinking_delay_ms: default_thinking_delay(),
            search_first: true,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Sliding-window size kept on save; the pruned head is summarised.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
    #[serde(default = "default_summary_ttl_days")]
    pub summary_ttl_days: i64,
    #[serde(default = "default_daily_fact_ttl_days")]
    pub daily_fact_ttl_days: i64,
    /// Compaction fires at this fraction of the target model's context…
    #[serde(default = "default_compact_fraction")]
    pub compact_context_fraction: f64,
    /// …but only once the history has at least this many messages.
    #[serde(default = "default_compact_min_messages")]
    pub compact_min_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_window: default_history_window(),
            session_ttl_days: default_session_ttl_days(),
            summary_ttl_days: default_summary_ttl_days(),
            daily_fact_ttl_days: default_daily_fact_ttl_days(),
            compact_context_fraction: default_compact_fraction(),
            compact_min_messages: default_compact_min_messages(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(String);

impl ScoopConfig {
    /// Load config from a TOML file with SCOOP_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SCOOP_").split("_"))
            .extract()
            .map_err(|e| ConfigError(e.to_string()))
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_origins() -> String {
    "*".to_string()
}
fn default_llm_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_llm_timeout() -> u64 {
    30
}
fn default_primary_model() -> String {
    "gemini-3-flash-preview".to_string()
}
fn default_extended_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_fallback_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_failure_threshold() -> usize {
    5
}
fn default_window_secs() -> u64 {
    60
}
fn default_recovery_secs() -> u64 {
    60
}
fn default_extended_threshold() -> u32 {
    150_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_rounds() -> usize {
    5
}
fn default_round_timeout() -> u64 {
    30
}
fn default_max_unique_queries() -> usize {
    3
}
fn default_thinking() -> String {
    "simple_loader".to_string()
}
fn default_thinking_delay() -> u64 {
    400
}
fn default_temperature() -> f32 {
    1.0
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.scoop/scoop.db", home)
}
fn default_history_window() -> usize {
    30
}
fn default_session_ttl_days() -> i64 {
    7
}
fn default_summary_ttl_days() -> i64 {
    30
}
fn default_daily_fact_ttl_days() -> i64 {
    60
}
fn default_compact_fraction() -> f64 {
    0.75
}
fn default_compact_min_messages() -> usize {
    20
}
fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.scoop/scoop.toml", home)
}
fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_values() {
        let cfg = ScoopConfig::default();
        assert_eq!(cfg.inference.circuit_failure_threshold, 5);
        assert_eq!(cfg.inference.extended_context_threshold, 150_000);
        assert_eq!(cfg.engine.max_rounds, 5);
        assert_eq!(cfg.engine.max_unique_queries, 3);
        assert_eq!(cfg.memory.history_window, 30);
        assert_eq!(cfg.memory.session_ttl_days, 7);
        assert_eq!(cfg.memory.daily_fact_ttl_days, 60);
    }
}
