//! Text embedding over an HTTP feature-extraction endpoint.
//!
//! E5-style models expect every input to carry a role prefix, so callers pick an
//! [`EmbedMode`] and the embedder prepends `passage: ` or `query: `.

use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use harvester_shared::{EmbeddingConfig, HarvestError, Result};

/// Role of the text being embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    /// Content stored in the index.
    Passage,
    /// A user question matched against stored passages.
    Query,
}

impl EmbedMode {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Passage => "passage: ",
            Self::Query => "query: ",
        }
    }
}

/// Produces one vector per input text.
pub trait Embedder {
    /// Model identifier recorded next to stored vectors.
    fn model(&self) -> &str;

    /// Embed `texts`, returning vectors in input order.
    fn embed(
        &self,
        texts: &[String],
        mode: EmbedMode,
    ) -> impl Future<Output = Result<Vec<Vec<f32>>>>;
}

// ---------------------------------------------------------------------------
// HTTP embedder
// ---------------------------------------------------------------------------

/// Hugging Face style inference client.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    token: String,
    batch_size: usize,
    cold_start_wait: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Batch(Vec<Vec<f32>>),
    Single(Vec<f32>),
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| HarvestError::network("embedding client", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            token: token.into(),
            batch_size: 32,
            cold_start_wait: Duration::from_secs(20),
        })
    }

    /// Build from config, reading the API token from the configured variable.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let token = std::env::var(&config.api_key_env).map_err(|_| {
            HarvestError::config(format!(
                "embedding token not set: export {}",
                config.api_key_env
            ))
        })?;
        Ok(Self::new(&config.endpoint, &config.model, token)?
            .with_batch_size(config.batch_size)
            .with_cold_start_wait(Duration::from_secs(config.cold_start_wait_secs)))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Wait applied once when the endpoint answers 503 while the model loads.
    pub fn with_cold_start_wait(mut self, wait: Duration) -> Self {
        self.cold_start_wait = wait;
        self
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "inputs": inputs,
            "options": { "wait_for_model": true },
        });

        let mut response = self.post(&body).await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            warn!(
                wait_secs = self.cold_start_wait.as_secs(),
                "embedding model loading, retrying once"
            );
            tokio::time::sleep(self.cold_start_wait).await;
            response = self.post(&body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(HarvestError::embedding(format!(
                "endpoint returned {status}: {}",
                detail.trim()
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| HarvestError::embedding(format!("unexpected response shape: {e}")))?;
        let vectors = match parsed {
            EmbeddingResponse::Batch(v) => v,
            EmbeddingResponse::Single(v) => vec![v],
        };

        if vectors.len() != inputs.len() {
            return Err(HarvestError::embedding(format!(
                "expected {} vectors, got {}",
                inputs.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        self.client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| HarvestError::network(&self.endpoint, e))
    }
}

impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(count = texts.len(), model = %self.model))]
    async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let inputs: Vec<String> = batch
                .iter()
                .map(|t| format!("{}{t}", mode.prefix()))
                .collect();
            vectors.extend(self.embed_batch(&inputs).await?);
        }
        debug!(vectors = vectors.len(), "embedded");
        Ok(vectors)
    }
}
