use std::sync::Arc;

use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Dimension of the bundled sentence-transformer model.
const FASTEMBED_DIMENSION: usize = 384;

/// Anything that can turn text into vectors. The pipeline only depends on
/// this trait; tests plug in deterministic stubs.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;

    fn backend_label(&self) -> &'static str;
}

enum Backend {
    FastEmbed(Mutex<TextEmbedding>),
    OpenAI {
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
}

pub struct EmbeddingProvider {
    backend: Backend,
}

impl EmbeddingProvider {
    pub fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<async_openai::Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let backend = match config.embedding_backend {
            EmbeddingBackend::FastEmbed => {
                let model = TextEmbedding::try_new(InitOptions::new(
                    EmbeddingModel::AllMiniLML6V2,
                ))
                .map_err(|e| {
                    AppError::InternalError(format!("failed to initialize fastembed: {e}"))
                })?;
                Backend::FastEmbed(Mutex::new(model))
            }
            EmbeddingBackend::OpenAI => {
                let client = openai_client.ok_or_else(|| {
                    AppError::Validation(
                        "openai embedding backend requires an OpenAI client".into(),
                    )
                })?;
                Backend::OpenAI {
                    client,
                    model: config.openai_embedding_model.clone(),
                    dimensions: config.openai_embedding_dimensions,
                }
            }
        };
        Ok(Self { backend })
    }
}

#[async_trait]
impl Embedder for EmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.backend {
            Backend::FastEmbed(model) => {
                let mut guard = model.lock().await;
                let vectors = guard
                    .embed(texts.to_vec(), None)
                    .map_err(|e| AppError::InternalError(format!("fastembed failed: {e}")))?;
                Ok(vectors)
            }
            Backend::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
                let response = Retry::spawn(retry_strategy, || async {
                    let request = CreateEmbeddingRequestArgs::default()
                        .model(model)
                        .dimensions(*dimensions)
                        .input(texts.to_vec())
                        .build()?;
                    client.embeddings().create(request).await.map_err(AppError::OpenAI)
                })
                .await?;

                debug!(count = response.data.len(), "embeddings created");

                if response.data.len() != texts.len() {
                    return Err(AppError::LLMParsing(
                        "embedding response count does not match input".into(),
                    ));
                }

                let mut rows = response.data;
                rows.sort_by_key(|d| d.index);
                Ok(rows.into_iter().map(|d| d.embedding).collect())
            }
        }
    }

    fn dimension(&self) -> usize {
        match &self.backend {
            Backend::FastEmbed(_) => FASTEMBED_DIMENSION,
            Backend::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    fn backend_label(&self) -> &'static str {
        match &self.backend {
            Backend::FastEmbed(_) => "fastembed",
            Backend::OpenAI { .. } => "openai",
        }
    }
}
