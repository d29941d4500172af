use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    FastEmbed,
    OpenAI,
}

fn default_embedding_backend() -> EmbeddingBackend {
    EmbeddingBackend::FastEmbed
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub openai_embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub openai_embedding_dimensions: u32,
    #[serde(default = "default_validation_max_concurrent")]
    pub validation_max_concurrent: usize,
    #[serde(default = "default_rewrite_max_concurrent")]
    pub rewrite_max_concurrent: usize,
    /// Per-task validation deadline in seconds.
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout: u64,
    /// Per-task rewrite deadline in seconds.
    #[serde(default = "default_rewrite_timeout")]
    pub rewrite_timeout: u64,
    #[serde(default = "default_chunk_tokens_min")]
    pub chunk_tokens_min: usize,
    #[serde(default = "default_chunk_tokens_max")]
    pub chunk_tokens_max: usize,
    #[serde(default = "default_chunk_overlap_tokens")]
    pub chunk_overlap_tokens: usize,
    #[serde(default = "default_verdict_threshold")]
    pub verdict_threshold: f32,
    /// Optional external sink that receives each mined DTO as a POST.
    /// Delivery is best-effort; failures are logged and never retried.
    #[serde(default)]
    pub req_worker_endpoint: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1536
}

fn default_validation_max_concurrent() -> usize {
    5
}

fn default_rewrite_max_concurrent() -> usize {
    3
}

fn default_validation_timeout() -> u64 {
    120
}

fn default_rewrite_timeout() -> u64 {
    60
}

fn default_chunk_tokens_min() -> usize {
    200
}

fn default_chunk_tokens_max() -> usize {
    400
}

fn default_chunk_overlap_tokens() -> usize {
    50
}

fn default_verdict_threshold() -> f32 {
    0.7
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(any(test, feature = "test-utils"))]
impl AppConfig {
    /// Configuration suitable for tests: in-memory friendly defaults, no LLM key.
    pub fn for_tests() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "test".to_string(),
            surrealdb_database: "test".to_string(),
            http_port: 0,
            openai_api_key: None,
            openai_base_url: default_base_url(),
            model_name: default_model_name(),
            embedding_backend: EmbeddingBackend::FastEmbed,
            openai_embedding_model: default_embedding_model(),
            openai_embedding_dimensions: default_embedding_dimensions(),
            validation_max_concurrent: default_validation_max_concurrent(),
            rewrite_max_concurrent: default_rewrite_max_concurrent(),
            validation_timeout: default_validation_timeout(),
            rewrite_timeout: default_rewrite_timeout(),
            chunk_tokens_min: default_chunk_tokens_min(),
            chunk_tokens_max: default_chunk_tokens_max(),
            chunk_overlap_tokens: default_chunk_overlap_tokens(),
            verdict_threshold: default_verdict_threshold(),
            req_worker_endpoint: None,
        }
    }
}
