//! Cross-encoder reranking
//!
//! Reorders the top fused candidates with a more expensive pairwise model.
//! Two guarantees: candidates matching a deterministic query code are never
//! demoted below the pin rank, and a model timeout or failure leaves the
//! fused order untouched apart from a "skipped" flag.

use crate::fusion::FusedResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Rerank settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub enabled: bool,

    /// Model name, for logging and the cache version tag
    pub model: String,

    /// How many fused candidates are rescored
    pub top_n: usize,

    /// Code-matched candidates stay within this rank
    pub pin_top: usize,

    /// Budget for one batched scoring call
    pub timeout_ms: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "Xenova/ms-marco-MiniLM-L-6-v2".to_string(),
            top_n: 100,
            pin_top: 10,
            timeout_ms: 2000,
        }
    }
}

/// Batched pairwise relevance model collaborator
#[async_trait]
pub trait RerankModel: Send + Sync {
    /// Relevance score per candidate text, aligned with the input order
    async fn score(&self, query: &str, candidates: &[String]) -> anyhow::Result<Vec<f32>>;
}

/// fastembed cross-encoder implementation
pub struct FastEmbedReranker {
    model: Arc<fastembed::TextRerank>,
}

impl FastEmbedReranker {
    pub fn new() -> anyhow::Result<Self> {
        let options =
            fastembed::RerankInitOptions::new(fastembed::RerankerModel::BGERerankerBase)
                .with_show_download_progress(false);
        let model = fastembed::TextRerank::try_new(options)?;
        Ok(Self {
            model: Arc::new(model),
        })
    }
}

#[async_trait]
impl RerankModel for FastEmbedReranker {
    async fn score(&self, query: &str, candidates: &[String]) -> anyhow::Result<Vec<f32>> {
        let documents: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
        let results = self.model.rerank(query, documents, true, None)?;

        let mut scores = vec![0.0f32; candidates.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

/// Result of a rerank pass
#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<FusedResult>,
    /// True when the model timed out or failed and the fused order stands
    pub skipped: bool,
}

/// Applies the rerank model under the safety rules
pub struct Reranker {
    model: Arc<dyn RerankModel>,
    config: RerankConfig,
}

impl Reranker {
    pub fn new(model: Arc<dyn RerankModel>, config: RerankConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Rescore the top `top_n` candidates and reorder
    ///
    /// `texts` maps unit id to hydrated text; `pinned` holds unit ids whose
    /// unit or owning document matches a deterministic query code.
    pub async fn rerank(
        &self,
        query_text: &str,
        fused: Vec<FusedResult>,
        texts: &HashMap<String, String>,
        pinned: &HashSet<String>,
    ) -> RerankOutcome {
        if fused.len() < 2 {
            return RerankOutcome {
                results: fused,
                skipped: false,
            };
        }

        let cut = self.config.top_n.min(fused.len());
        let mut head: Vec<FusedResult> = fused;
        let tail: Vec<FusedResult> = head.split_off(cut);

        let candidate_texts: Vec<String> = head
            .iter()
            .map(|r| texts.get(&r.unit_id).cloned().unwrap_or_default())
            .collect();

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let scores =
            match tokio::time::timeout(timeout, self.model.score(query_text, &candidate_texts))
                .await
            {
                Ok(Ok(scores)) if scores.len() == head.len() => scores,
                Ok(Ok(_)) => {
                    tracing::warn!("rerank model returned misaligned scores, skipping");
                    return skipped(head, tail);
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "rerank model failed, keeping fused order");
                    return skipped(head, tail);
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.timeout_ms,
                        "rerank timed out, keeping fused order"
                    );
                    return skipped(head, tail);
                }
            };

        for (result, score) in head.iter_mut().zip(&scores) {
            result.rerank_score = Some(*score);
        }
        head.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });

        let head = self.apply_pins(head, pinned);

        let mut results = head;
        results.extend(tail);
        RerankOutcome {
            results,
            skipped: false,
        }
    }

    /// Lift code-matched candidates back into the pin window
    fn apply_pins(&self, reranked: Vec<FusedResult>, pinned: &HashSet<String>) -> Vec<FusedResult> {
        let pin_top = self.config.pin_top;
        let demoted: Vec<bool> = reranked
            .iter()
            .enumerate()
            .map(|(rank, r)| rank >= pin_top && pinned.contains(&r.unit_id))
            .collect();
        if !demoted.iter().any(|d| *d) {
            return reranked;
        }

        let mut lifted = Vec::new();
        let mut kept = Vec::new();
        for (result, was_demoted) in reranked.into_iter().zip(demoted) {
            if was_demoted {
                lifted.push(result);
            } else {
                kept.push(result);
            }
        }

        let insert_at = pin_top.saturating_sub(lifted.len()).min(kept.len());
        kept.splice(insert_at..insert_at, lifted);
        kept
    }
}

fn skipped(head: Vec<FusedResult>, tail: Vec<FusedResult>) -> RerankOutcome {
    let mut results = head;
    results.extend(tail);
    RerankOutcome {
        results,
        skipped: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FixedModel(Vec<f32>);

    #[async_trait]
    impl RerankModel for FixedModel {
        async fn score(&self, _query: &str, candidates: &[String]) -> anyhow::Result<Vec<f32>> {
            Ok(self.0[..candidates.len()].to_vec())
        }
    }

    struct SlowModel;

    #[async_trait]
    impl RerankModel for SlowModel {
        async fn score(&self, _query: &str, _candidates: &[String]) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn fused(id: &str, score: f32) -> FusedResult {
        FusedResult {
            unit_id: id.to_string(),
            fused_score: score,
            component_scores: BTreeMap::new(),
            rerank_score: None,
        }
    }

    fn texts(ids: &[&str]) -> HashMap<String, String> {
        ids.iter()
            .map(|id| (id.to_string(), format!("text {}", id)))
            .collect()
    }

    #[tokio::test]
    async fn reorders_by_model_score() {
        let reranker = Reranker::new(
            Arc::new(FixedModel(vec![0.1, 0.9, 0.5])),
            RerankConfig::default(),
        );
        let outcome = reranker
            .rerank(
                "q",
                vec![fused("a", 0.9), fused("b", 0.8), fused("c", 0.7)],
                &texts(&["a", "b", "c"]),
                &HashSet::new(),
            )
            .await;

        assert!(!outcome.skipped);
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(outcome.results[0].rerank_score, Some(0.9));
    }

    #[tokio::test]
    async fn timeout_keeps_fused_order() {
        let config = RerankConfig {
            timeout_ms: 20,
            ..RerankConfig::default()
        };
        let reranker = Reranker::new(Arc::new(SlowModel), config);
        let input = vec![fused("a", 0.9), fused("b", 0.8)];
        let outcome = reranker
            .rerank("q", input.clone(), &texts(&["a", "b"]), &HashSet::new())
            .await;

        assert!(outcome.skipped);
        assert_eq!(outcome.results, input);
    }

    #[tokio::test]
    async fn pinned_candidate_is_not_demoted() {
        let config = RerankConfig {
            pin_top: 2,
            ..RerankConfig::default()
        };
        // Model hates "a", which is pinned
        let reranker = Reranker::new(Arc::new(FixedModel(vec![0.0, 0.9, 0.8, 0.7])), config);
        let pinned: HashSet<String> = ["a".to_string()].into_iter().collect();
        let outcome = reranker
            .rerank(
                "q",
                vec![fused("a", 1.0), fused("b", 0.9), fused("c", 0.8), fused("d", 0.7)],
                &texts(&["a", "b", "c", "d"]),
                &pinned,
            )
            .await;

        let rank_of_a = outcome
            .results
            .iter()
            .position(|r| r.unit_id == "a")
            .unwrap();
        assert!(rank_of_a < 2, "pinned unit fell to rank {}", rank_of_a);
        // The model's favorite still leads
        assert_eq!(outcome.results[0].unit_id, "b");
    }

    #[tokio::test]
    async fn tail_beyond_top_n_is_untouched() {
        let config = RerankConfig {
            top_n: 2,
            ..RerankConfig::default()
        };
        let reranker = Reranker::new(Arc::new(FixedModel(vec![0.1, 0.9])), config);
        let outcome = reranker
            .rerank(
                "q",
                vec![fused("a", 0.9), fused("b", 0.8), fused("c", 0.7)],
                &texts(&["a", "b", "c"]),
                &HashSet::new(),
            )
            .await;

        let ids: Vec<&str> = outcome.results.iter().map(|r| r.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(outcome.results[2].rerank_score.is_none());
    }

    #[tokio::test]
    #[ignore] // Requires model download
    async fn fastembed_reranker_prefers_relevant_text() {
        let model = FastEmbedReranker::new().unwrap();
        let scores = model
            .score(
                "anticoagulant bleeding risk",
                &[
                    "major bleeding occurred in the anticoagulant arm".to_string(),
                    "the weather was unremarkable".to_string(),
                ],
            )
            .await
            .unwrap();
        assert!(scores[0] > scores[1]);
    }
}
