//! Keyword scoring, semantic ranking, hybrid merge, and context budgets.
//!
//! Both searchers read through the [`Store`] trait and are independent of
//! any runtime; the application runs them concurrently and joins them
//! before calling [`hybrid_merge`].
//!
//! # Scoring
//!
//! * **Keyword**: query terms are lowercased alphanumeric tokens. A term
//!   matches a chunk when the lowercased chunk text contains it. With `N`
//!   chunks in scope and `df` chunks containing the term,
//!   `idf = ln(1 + (N + 1) / (df + 1))`, and a chunk scores
//!   `Σ idf(matched) / Σ idf(all query terms)`. The score lies in `(0, 1]`
//!   and grows with both the number and the rarity of matched terms.
//! * **Semantic**: cosine similarity, thresholded on the raw value, then
//!   clamped to `[0, 1]`.
//! * **Both**: combined with a [`ScoreCombiner`].
//!
//! Every ranked list is ordered by score descending, then `ordinal`
//! ascending, then `chunk_id` ascending.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Chunk, MatchKind, RetrievalResult, Scope};
use crate::store::Store;

/// A chunk with its normalized score from one search leg.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Lowercased alphanumeric query terms, deduplicated, in first-seen order.
pub fn tokenize(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for raw in query.split(|c: char| !c.is_alphanumeric()) {
        if raw.is_empty() {
            continue;
        }
        let term = raw.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

fn idf(total: usize, df: usize) -> f64 {
    (1.0 + (total as f64 + 1.0) / (df as f64 + 1.0)).ln()
}

/// Score `chunks` against `query`, returning at most `limit` ranked matches.
///
/// Chunks matching no term are omitted. An empty query matches nothing.
pub fn rank_keyword(chunks: &[Chunk], query: &str, limit: usize) -> Vec<ScoredChunk> {
    let terms = tokenize(query);
    if terms.is_empty() || chunks.is_empty() || limit == 0 {
        return Vec::new();
    }

    let lowered: Vec<String> = chunks.iter().map(|c| c.text.to_lowercase()).collect();
    let matched: Vec<Vec<bool>> = lowered
        .iter()
        .map(|text| terms.iter().map(|t| text.contains(t.as_str())).collect())
        .collect();

    let weights: Vec<f64> = (0..terms.len())
        .map(|i| idf(chunks.len(), matched.iter().filter(|m| m[i]).count()))
        .collect();
    let total_weight: f64 = weights.iter().sum();

    let mut scored: Vec<ScoredChunk> = chunks
        .iter()
        .zip(&matched)
        .filter_map(|(chunk, hits)| {
            let weight: f64 = hits
                .iter()
                .zip(&weights)
                .filter(|(hit, _)| **hit)
                .map(|(_, w)| w)
                .sum();
            (weight > 0.0).then(|| ScoredChunk {
                chunk: chunk.clone(),
                score: (weight / total_weight).min(1.0),
            })
        })
        .collect();

    sort_scored(&mut scored);
    scored.truncate(limit);
    scored
}

/// Descending score, then ascending ordinal, then ascending chunk id.
pub fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.ordinal.cmp(&b.chunk.ordinal))
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Lexical search over every live chunk visible under `scope`.
pub async fn keyword_search<S: Store + ?Sized>(
    store: &S,
    query: &str,
    scope: &Scope,
    limit: usize,
) -> Result<Vec<ScoredChunk>> {
    if tokenize(query).is_empty() {
        return Ok(Vec::new());
    }
    let chunks = store.scan_by_scope(scope).await?;
    Ok(rank_keyword(&chunks, query, limit))
}

/// Similarity search restricted to `scope` and to embeddings of `model`.
pub async fn semantic_search<S: Store + ?Sized>(
    store: &S,
    query_vector: &[f32],
    model: &str,
    scope: &Scope,
    threshold: f64,
    top_k: usize,
) -> Result<Vec<ScoredChunk>> {
    if query_vector.is_empty() {
        return Err(Error::validation("query vector must not be empty"));
    }
    if top_k == 0 {
        return Ok(Vec::new());
    }
    let matches = store
        .similarity_search(query_vector, model, scope, top_k, threshold)
        .await?;
    let mut scored: Vec<ScoredChunk> = matches
        .into_iter()
        .filter(|m| m.similarity >= threshold)
        .map(|m| ScoredChunk {
            score: m.similarity.clamp(0.0, 1.0),
            chunk: m.chunk,
        })
        .collect();
    sort_scored(&mut scored);
    scored.truncate(top_k);
    Ok(scored)
}

/// Semantic weight used by `weighted_sum` when none is configured.
pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.6;

/// How a chunk found by both legs gets its combined score.
///
/// Every variant is monotonic in both inputs. Single-leg chunks keep their
/// leg's score regardless of the combiner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreCombiner {
    /// `max(keyword, semantic)`.
    Max,
    /// `1 - (1 - keyword)(1 - semantic)`, never below `Max`.
    ProbabilisticOr,
    /// `w * semantic + (1 - w) * keyword`.
    WeightedSum { semantic_weight: f64 },
}

impl Default for ScoreCombiner {
    fn default() -> Self {
        Self::Max
    }
}

impl ScoreCombiner {
    /// Build from a config name. `semantic_weight` is only read by
    /// `weighted_sum`.
    pub fn from_name(name: &str, semantic_weight: f64) -> Result<Self> {
        match name {
            "max" => Ok(Self::Max),
            "probabilistic_or" => Ok(Self::ProbabilisticOr),
            "weighted_sum" => {
                if !(0.0..=1.0).contains(&semantic_weight) {
                    return Err(Error::validation(format!(
                        "semantic_weight must be in [0.0, 1.0], got {}",
                        semantic_weight
                    )));
                }
                Ok(Self::WeightedSum { semantic_weight })
            }
            other => Err(Error::validation(format!(
                "unknown combiner '{}'; use max, probabilistic_or, or weighted_sum",
                other
            ))),
        }
    }

    pub fn combine(&self, keyword: f64, semantic: f64) -> f64 {
        let combined = match self {
            Self::Max => keyword.max(semantic),
            Self::ProbabilisticOr => 1.0 - (1.0 - keyword) * (1.0 - semantic),
            Self::WeightedSum { semantic_weight } => {
                semantic_weight * semantic + (1.0 - semantic_weight) * keyword
            }
        };
        combined.clamp(0.0, 1.0)
    }
}

impl FromStr for ScoreCombiner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s, DEFAULT_SEMANTIC_WEIGHT)
    }
}

/// Merge both legs by chunk id, rank, and assign 1-based ranks.
pub fn hybrid_merge(
    keyword: Vec<ScoredChunk>,
    semantic: Vec<ScoredChunk>,
    combiner: ScoreCombiner,
) -> Vec<RetrievalResult> {
    struct Entry {
        chunk: Chunk,
        keyword: Option<f64>,
        semantic: Option<f64>,
    }

    let mut merged: HashMap<String, Entry> = HashMap::new();
    for sc in keyword {
        merged
            .entry(sc.chunk.id.clone())
            .and_modify(|e| e.keyword = Some(e.keyword.unwrap_or(0.0).max(sc.score)))
            .or_insert(Entry {
                keyword: Some(sc.score),
                semantic: None,
                chunk: sc.chunk,
            });
    }
    for sc in semantic {
        merged
            .entry(sc.chunk.id.clone())
            .and_modify(|e| e.semantic = Some(e.semantic.unwrap_or(0.0).max(sc.score)))
            .or_insert(Entry {
                keyword: None,
                semantic: Some(sc.score),
                chunk: sc.chunk,
            });
    }

    let mut results: Vec<RetrievalResult> = merged
        .into_values()
        .filter_map(|e| {
            let (score, match_kind) = match (e.keyword, e.semantic) {
                (Some(k), Some(s)) => (combiner.combine(k, s), MatchKind::Both),
                (Some(k), None) => (k, MatchKind::Keyword),
                (None, Some(s)) => (s, MatchKind::Semantic),
                (None, None) => return None,
            };
            Some(RetrievalResult {
                chunk_id: e.chunk.id,
                source_document_id: e.chunk.source_document_id,
                ordinal: e.chunk.ordinal,
                text: e.chunk.text,
                score,
                match_kind,
                rank: 0,
                keyword_score: e.keyword,
                semantic_score: e.semantic,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.ordinal.cmp(&b.ordinal))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    results
}

/// Size of the assembled context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_results: usize,
    /// Cumulative text length cap, in characters.
    pub max_chars: Option<usize>,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_results: 8,
            max_chars: None,
        }
    }
}

impl ContextBudget {
    /// Keep the ranked prefix that fits.
    ///
    /// Stops at the first result that would overflow `max_chars`; the
    /// top-ranked result is always kept so a non-empty ranking never
    /// collapses to nothing.
    pub fn apply(&self, mut ranked: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
        ranked.truncate(self.max_results);
        if let Some(max_chars) = self.max_chars {
            let mut used = 0usize;
            let mut keep = 0usize;
            for r in &ranked {
                let len = r.text.chars().count();
                if keep > 0 && used + len > max_chars {
                    break;
                }
                used += len;
                keep += 1;
            }
            ranked.truncate(keep);
        }
        ranked
    }
}

/// Per-query retrieval knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOptions {
    /// Minimum raw cosine for semantic candidates.
    pub threshold: f64,
    pub top_k: usize,
    pub keyword_limit: usize,
    pub combiner: ScoreCombiner,
    pub budget: ContextBudget,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            threshold: 0.25,
            top_k: 20,
            keyword_limit: 20,
            combiner: ScoreCombiner::Max,
            budget: ContextBudget::default(),
        }
    }
}

impl RetrievalOptions {
    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.threshold) {
            return Err(Error::validation(format!(
                "threshold must be in [-1.0, 1.0], got {}",
                self.threshold
            )));
        }
        if self.budget.max_results == 0 {
            return Err(Error::validation("max_results must be at least 1"));
        }
        if let ScoreCombiner::WeightedSum { semantic_weight } = self.combiner {
            if !(0.0..=1.0).contains(&semantic_weight) {
                return Err(Error::validation(format!(
                    "semantic_weight must be in [0.0, 1.0], got {}",
                    semantic_weight
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, ordinal: u32, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            source_document_id: "doc".to_string(),
            ordinal,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
            owner_scope: None,
        }
    }

    fn scored(id: &str, ordinal: u32, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(id, ordinal, id),
            score,
        }
    }

    #[test]
    fn test_tokenize_lowercases_and_dedupes() {
        assert_eq!(
            tokenize("Rust, rust! Tokio-runtime"),
            vec!["rust", "tokio", "runtime"]
        );
        assert!(tokenize("  ... ").is_empty());
    }

    #[test]
    fn test_keyword_case_insensitive() {
        let chunks = vec![chunk("a", 0, "The QUICK brown fox")];
        let hits = rank_keyword(&chunks, "quick", 10);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_more_terms_score_higher() {
        let chunks = vec![
            chunk("a", 0, "apples only"),
            chunk("b", 1, "apples and pears"),
            chunk("c", 2, "nothing here"),
        ];
        let hits = rank_keyword(&chunks, "apples pears", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.id, "b");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_keyword_rarer_terms_score_higher() {
        let chunks = vec![
            chunk("a", 0, "common rare"),
            chunk("b", 1, "common"),
            chunk("c", 2, "common"),
            chunk("d", 3, "rare2"),
        ];
        // "rare" appears in a and d, "common" in a, b, c.
        let hits = rank_keyword(&chunks, "common rare", 10);
        let score_of = |id: &str| hits.iter().find(|h| h.chunk.id == id).unwrap().score;
        assert!(score_of("d") > score_of("b"));
        assert!(score_of("a") > score_of("d"));
    }

    #[test]
    fn test_keyword_ties_break_by_ordinal_then_id() {
        let chunks = vec![
            chunk("z", 1, "match"),
            chunk("b", 0, "match"),
            chunk("a", 0, "match"),
        ];
        let hits = rank_keyword(&chunks, "match", 10);
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "z"]);
    }

    #[test]
    fn test_keyword_limit_and_empty_query() {
        let chunks = vec![chunk("a", 0, "x y"), chunk("b", 1, "x")];
        assert_eq!(rank_keyword(&chunks, "x", 1).len(), 1);
        assert!(rank_keyword(&chunks, "", 10).is_empty());
        assert!(rank_keyword(&chunks, "x", 0).is_empty());
    }

    #[test]
    fn test_merge_both_uses_max_combiner() {
        let merged = hybrid_merge(
            vec![scored("c1", 0, 0.6)],
            vec![scored("c1", 0, 0.9)],
            ScoreCombiner::Max,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].match_kind, MatchKind::Both);
        assert!(merged[0].score >= 0.9);
        assert_eq!(merged[0].keyword_score, Some(0.6));
        assert_eq!(merged[0].semantic_score, Some(0.9));
        assert_eq!(merged[0].rank, 1);
    }

    #[test]
    fn test_merge_single_leg_keeps_score_and_kind() {
        let merged = hybrid_merge(
            vec![scored("k", 0, 0.4)],
            vec![scored("s", 1, 0.7)],
            ScoreCombiner::ProbabilisticOr,
        );
        assert_eq!(merged[0].chunk_id, "s");
        assert_eq!(merged[0].match_kind, MatchKind::Semantic);
        assert!((merged[0].score - 0.7).abs() < 1e-9);
        assert_eq!(merged[1].match_kind, MatchKind::Keyword);
        assert_eq!(merged[1].rank, 2);
    }

    #[test]
    fn test_combiners_are_monotonic() {
        let combiners = [
            ScoreCombiner::Max,
            ScoreCombiner::ProbabilisticOr,
            ScoreCombiner::WeightedSum {
                semantic_weight: 0.6,
            },
        ];
        for c in combiners {
            assert!(c.combine(0.5, 0.5) <= c.combine(0.6, 0.5));
            assert!(c.combine(0.5, 0.5) <= c.combine(0.5, 0.6));
        }
        assert!(ScoreCombiner::ProbabilisticOr.combine(0.6, 0.9) >= 0.9);
        let w = ScoreCombiner::WeightedSum {
            semantic_weight: 0.6,
        };
        assert!((w.combine(0.5, 1.0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_combiner_from_name() {
        assert_eq!(ScoreCombiner::from_name("max", 0.0).unwrap(), ScoreCombiner::Max);
        assert!(ScoreCombiner::from_name("weighted_sum", 1.5).is_err());
        assert!(ScoreCombiner::from_name("sum", 0.5).is_err());
        assert_eq!(
            "probabilistic_or".parse::<ScoreCombiner>().unwrap(),
            ScoreCombiner::ProbabilisticOr
        );
        assert_eq!(
            "weighted_sum".parse::<ScoreCombiner>().unwrap(),
            ScoreCombiner::WeightedSum {
                semantic_weight: DEFAULT_SEMANTIC_WEIGHT
            }
        );
    }

    #[test]
    fn test_merge_is_deterministic() {
        let kw = vec![scored("b", 0, 0.5), scored("a", 0, 0.5), scored("c", 2, 0.5)];
        let sem = vec![scored("d", 1, 0.5)];
        let first = hybrid_merge(kw.clone(), sem.clone(), ScoreCombiner::Max);
        let second = hybrid_merge(kw, sem, ScoreCombiner::Max);
        assert_eq!(first, second);
        let ids: Vec<&str> = first.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d", "c"]);
    }

    #[test]
    fn test_budget_by_count() {
        let ranked = hybrid_merge(
            vec![scored("a", 0, 0.9), scored("b", 1, 0.8), scored("c", 2, 0.7)],
            Vec::new(),
            ScoreCombiner::Max,
        );
        let budget = ContextBudget {
            max_results: 2,
            max_chars: None,
        };
        assert_eq!(budget.apply(ranked).len(), 2);
    }

    #[test]
    fn test_budget_by_chars_stops_at_first_overflow() {
        let mk = |id: &str, ordinal: u32, len: usize, score: f64| ScoredChunk {
            chunk: chunk(id, ordinal, &"x".repeat(len)),
            score,
        };
        let ranked = hybrid_merge(
            vec![mk("a", 0, 40, 0.9), mk("b", 1, 40, 0.8), mk("c", 2, 5, 0.7)],
            Vec::new(),
            ScoreCombiner::Max,
        );
        let budget = ContextBudget {
            max_results: 10,
            max_chars: Some(60),
        };
        let kept = budget.apply(ranked);
        let ids: Vec<&str> = kept.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn test_budget_always_keeps_top_result() {
        let ranked = hybrid_merge(
            vec![ScoredChunk {
                chunk: chunk("a", 0, &"x".repeat(100)),
                score: 1.0,
            }],
            Vec::new(),
            ScoreCombiner::Max,
        );
        let budget = ContextBudget {
            max_results: 5,
            max_chars: Some(10),
        };
        assert_eq!(budget.apply(ranked).len(), 1);
    }

    #[test]
    fn test_options_validate() {
        assert!(RetrievalOptions::default().validate().is_ok());
        let mut opts = RetrievalOptions::default();
        opts.budget.max_results = 0;
        assert!(opts.validate().is_err());
        let opts = RetrievalOptions {
            threshold: 2.0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }
}
