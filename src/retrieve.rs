//! Hybrid retrieval: keyword and semantic legs run concurrently against the
//! same scope, then merge into one ranked, budgeted context set.
//!
//! Degradation rules:
//!
//! | Condition | Effect |
//! |-----------|--------|
//! | query embedding fails or provider disabled | semantic leg skipped, `embedding_unavailable` |
//! | keyword leg exceeds `search_timeout` | keyword leg empty, `keyword_timed_out` |
//! | semantic leg (query embedding plus search) exceeds `search_timeout` | semantic leg empty, `semantic_timed_out` |
//! | store unavailable | `Err(StoreUnavailable)` |
//! | caller cancels | `Err(Cancelled)`, partial results discarded |

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use ragline_core::models::{Degradation, MatchStats, Retrieval, Scope};
use ragline_core::search::{
    hybrid_merge, keyword_search, semantic_search, RetrievalOptions, ScoredChunk,
};
use ragline_core::store::Store;
use ragline_core::trace::{
    RetrievalSummary, ScoreSummary, TraceEvent, TracePayload, TraceRecorder,
};
use ragline_core::{Error, Result};

use crate::cancel::CancelToken;
use crate::gateway::EmbeddingGateway;

pub struct Retriever {
    store: Arc<dyn Store>,
    gateway: Arc<EmbeddingGateway>,
    recorder: Arc<TraceRecorder>,
    search_timeout: Duration,
}

/// What one leg produced.
struct Leg {
    hits: Vec<ScoredChunk>,
    timed_out: bool,
    elapsed: Duration,
}

impl Leg {
    fn done(hits: Vec<ScoredChunk>, started: Instant) -> Self {
        Self {
            hits,
            timed_out: false,
            elapsed: started.elapsed(),
        }
    }

    fn timed_out(started: Instant) -> Self {
        Self {
            hits: Vec::new(),
            timed_out: true,
            elapsed: started.elapsed(),
        }
    }
}

impl Retriever {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<EmbeddingGateway>,
        recorder: Arc<TraceRecorder>,
        search_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            recorder,
            search_timeout,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
        cancel: &CancelToken,
    ) -> Result<Retrieval> {
        options.validate()?;
        if query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        if let Scope::Owner(tag) = scope {
            if tag.trim().is_empty() {
                return Err(Error::validation("owner scope tag must not be empty"));
            }
        }

        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        match cancel.run(self.run_legs(query, scope, options, cancel)).await {
            Ok(Ok((keyword, semantic, mut degradations))) => {
                self.record_leg_events(&correlation_id, scope, &keyword, &semantic, &degradations);
                if keyword.timed_out {
                    degradations.push(Degradation::KeywordTimedOut);
                }
                if semantic.timed_out {
                    degradations.push(Degradation::SemanticTimedOut);
                }

                let merged = hybrid_merge(keyword.hits, semantic.hits, options.combiner);
                let results = options.budget.apply(merged);
                let match_stats = MatchStats::from_results(&results);
                let scores: Vec<f64> = results.iter().map(|r| r.score).collect();

                self.recorder.record(
                    TraceEvent::new(
                        correlation_id.clone(),
                        TracePayload::Retrieval(RetrievalSummary {
                            scope: scope.clone(),
                            result_count: results.len(),
                            match_stats,
                            scores: ScoreSummary::from_scores(&scores),
                            empty_result: results.is_empty(),
                            degradations: degradations.clone(),
                        }),
                    )
                    .with_duration(started.elapsed()),
                );
                info!(
                    scope = %scope,
                    results = results.len(),
                    degraded = !degradations.is_empty(),
                    "retrieval finished"
                );

                Ok(Retrieval {
                    correlation_id,
                    results,
                    match_stats,
                    degradations,
                })
            }
            Ok(Err(err)) | Err(err) => {
                if matches!(err, Error::Cancelled) {
                    self.recorder.record(
                        TraceEvent::new(
                            correlation_id,
                            TracePayload::Cancelled {
                                operation: "retrieve".to_string(),
                            },
                        )
                        .with_duration(started.elapsed()),
                    );
                } else {
                    warn!(scope = %scope, error = %err, "retrieval aborted");
                }
                Err(err)
            }
        }
    }

    async fn run_legs(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
        cancel: &CancelToken,
    ) -> Result<(Leg, Leg, Vec<Degradation>)> {
        let (keyword, semantic) = tokio::join!(
            self.keyword_leg(query, scope, options),
            self.semantic_leg(query, scope, options, cancel),
        );
        let keyword = keyword?;
        let (semantic, degradations) = semantic?;
        Ok((keyword, semantic, degradations))
    }

    async fn keyword_leg(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
    ) -> Result<Leg> {
        let started = Instant::now();
        let search = keyword_search(self.store.as_ref(), query, scope, options.keyword_limit);
        match tokio::time::timeout(self.search_timeout, search).await {
            Ok(hits) => Ok(Leg::done(hits?, started)),
            Err(_) => {
                warn!(scope = %scope, "keyword search timed out");
                Ok(Leg::timed_out(started))
            }
        }
    }

    /// The timeout covers the query embedding as well as the store search.
    async fn semantic_leg(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
        cancel: &CancelToken,
    ) -> Result<(Leg, Vec<Degradation>)> {
        let started = Instant::now();
        if !self.gateway.is_enabled() {
            return Ok((
                Leg::done(Vec::new(), started),
                vec![Degradation::EmbeddingUnavailable],
            ));
        }
        let leg = self.embed_and_search(query, scope, options, cancel);
        match tokio::time::timeout(self.search_timeout, leg).await {
            Ok(Ok(Some(hits))) => Ok((Leg::done(hits, started), Vec::new())),
            Ok(Ok(None)) => Ok((
                Leg::done(Vec::new(), started),
                vec![Degradation::EmbeddingUnavailable],
            )),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(scope = %scope, "semantic search timed out");
                Ok((Leg::timed_out(started), Vec::new()))
            }
        }
    }

    /// `None` when the query could not be embedded.
    async fn embed_and_search(
        &self,
        query: &str,
        scope: &Scope,
        options: &RetrievalOptions,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<ScoredChunk>>> {
        let vector = match self.gateway.embed_query(query, cancel).await {
            Ok(vector) => vector,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(error = %err, "query embedding failed, falling back to keyword only");
                return Ok(None);
            }
        };
        let hits = semantic_search(
            self.store.as_ref(),
            &vector,
            self.gateway.model(),
            scope,
            options.threshold,
            options.top_k,
        )
        .await?;
        Ok(Some(hits))
    }

    fn record_leg_events(
        &self,
        correlation_id: &str,
        scope: &Scope,
        keyword: &Leg,
        semantic: &Leg,
        degradations: &[Degradation],
    ) {
        let skipped = degradations.contains(&Degradation::EmbeddingUnavailable);
        debug!(
            keyword = keyword.hits.len(),
            semantic = semantic.hits.len(),
            skipped,
            "search legs joined"
        );
        self.recorder.record_all([
            TraceEvent::new(
                correlation_id,
                TracePayload::KeywordSearch {
                    scope: scope.clone(),
                    candidates: keyword.hits.len(),
                    timed_out: keyword.timed_out,
                },
            )
            .with_duration(keyword.elapsed),
            TraceEvent::new(
                correlation_id,
                TracePayload::SemanticSearch {
                    scope: scope.clone(),
                    candidates: semantic.hits.len(),
                    timed_out: semantic.timed_out,
                    skipped,
                },
            )
            .with_duration(semantic.elapsed),
        ]);
    }
}
