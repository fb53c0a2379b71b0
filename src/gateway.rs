//! Embedding gateway: batching, bounded retry, timeouts, and per-item
//! failure isolation around an [`Embedder`].
//!
//! [`EmbeddingGateway::embed_batch`] never fails as a whole except on
//! cancellation. Every input gets its own `Ok(vector)` or `Err(EmbedError)`:
//!
//! 1. Empty or whitespace-only texts fail validation and are never sent.
//! 2. Valid texts are grouped into batches of `batch_size`; up to
//!    `max_concurrency` batches are in flight at once.
//! 3. Each call is bounded by `call_timeout`. Transient failures (including
//!    timeouts) are retried with exponential backoff
//!    `backoff_base * 2^(attempt-1)`, capped at `2^5`. Invalid-request
//!    failures are not retried.
//! 4. When a multi-item batch still fails, its items are retried one by one
//!    so a single bad input cannot fail its neighbours.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use ragline_core::embedding::{EmbedError, Embedder};
use ragline_core::Error;

use crate::cancel::CancelToken;
use crate::config::EmbeddingConfig;

/// Outcome for one input text.
pub type ItemResult = Result<Vec<f32>, EmbedError>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&EmbeddingConfig::default())
    }
}

impl From<&EmbeddingConfig> for GatewayConfig {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            max_retries: config.max_retries,
            backoff_base: config.backoff_base(),
            call_timeout: config.timeout(),
        }
    }
}

pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    config: GatewayConfig,
}

impl EmbeddingGateway {
    pub fn new(embedder: Arc<dyn Embedder>, config: GatewayConfig) -> Self {
        Self { embedder, config }
    }

    /// Model identifier stamped on every embedding this gateway produces.
    pub fn model(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// A provider reporting zero dimensions is treated as disabled.
    pub fn is_enabled(&self) -> bool {
        self.embedder.dims() > 0
    }

    /// Embed `texts`, returning one result per input in input order.
    ///
    /// Returns `Err(Error::Cancelled)` if `cancel` fires first; partial
    /// results are discarded.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<ItemResult>, Error> {
        cancel.check()?;
        if !self.is_enabled() {
            return Ok(texts
                .iter()
                .map(|_| Err(EmbedError::Invalid("embedding provider is disabled".into())))
                .collect());
        }

        let mut results: Vec<Option<ItemResult>> = vec![None; texts.len()];
        let mut pending: Vec<(usize, String)> = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                results[i] = Some(Err(EmbedError::Invalid("text must not be empty".into())));
            } else {
                pending.push((i, text.clone()));
            }
        }

        let groups: Vec<Vec<(usize, String)>> = pending
            .chunks(self.config.batch_size)
            .map(|g| g.to_vec())
            .collect();

        let embedded = cancel
            .run(
                stream::iter(groups)
                    .map(|group| self.embed_group(group))
                    .buffered(self.config.max_concurrency)
                    .collect::<Vec<_>>(),
            )
            .await?;

        for (index, result) in embedded.into_iter().flatten() {
            results[index] = Some(result);
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(EmbedError::Invalid("no result produced".into()))))
            .collect())
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str, cancel: &CancelToken) -> Result<Vec<f32>, Error> {
        if text.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        let mut results = self.embed_batch(&[text.to_string()], cancel).await?;
        match results.pop() {
            Some(Ok(vector)) => Ok(vector),
            Some(Err(EmbedError::Transient(message))) => Err(Error::transient(message)),
            Some(Err(EmbedError::Invalid(message))) => Err(Error::validation(message)),
            None => Err(Error::transient("empty embedding response")),
        }
    }

    async fn embed_group(&self, group: Vec<(usize, String)>) -> Vec<(usize, ItemResult)> {
        let texts: Vec<String> = group.iter().map(|(_, t)| t.clone()).collect();
        match self.call_with_retry(&texts).await {
            Ok(vectors) => group
                .into_iter()
                .zip(vectors)
                .map(|((i, _), v)| (i, self.check_dims(v)))
                .collect(),
            Err(err) if group.len() > 1 => {
                warn!(
                    batch = group.len(),
                    error = %err,
                    "embedding batch failed, isolating items"
                );
                let mut out = Vec::with_capacity(group.len());
                for (i, text) in group {
                    let result = self
                        .call_with_retry(std::slice::from_ref(&text))
                        .await
                        .and_then(|mut v| {
                            v.pop()
                                .ok_or_else(|| EmbedError::Invalid("empty response".into()))
                        })
                        .and_then(|v| self.check_dims(v));
                    out.push((i, result));
                }
                out
            }
            Err(err) => group.into_iter().map(|(i, _)| (i, Err(err.clone()))).collect(),
        }
    }

    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut last_err = EmbedError::Transient("no attempt made".into());

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding call");
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.config.call_timeout, self.embedder.embed(texts)).await {
                Ok(Ok(vectors)) => {
                    if vectors.len() != texts.len() {
                        return Err(EmbedError::Invalid(format!(
                            "expected {} vectors, got {}",
                            texts.len(),
                            vectors.len()
                        )));
                    }
                    return Ok(vectors);
                }
                Ok(Err(err)) if err.is_transient() => last_err = err,
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    last_err = EmbedError::Transient(format!(
                        "embedding call timed out after {}ms",
                        self.config.call_timeout.as_millis()
                    ))
                }
            }
        }

        Err(last_err)
    }

    fn check_dims(&self, vector: Vec<f32>) -> ItemResult {
        let dims = self.embedder.dims();
        if vector.is_empty() || (dims > 0 && vector.len() != dims) {
            return Err(EmbedError::Invalid(format!(
                "expected {} dimensions, got {}",
                dims,
                vector.len()
            )));
        }
        Ok(vector)
    }
}
