//! Score normalization and multi-backend fusion
//!
//! Backend scores live on incomparable scales (BM25, dot product, cosine,
//! hop decay), so fusion is two-stage: each backend's candidate set is
//! normalized onto [0,1] with percentile-clipped min-max, then combined by
//! a weighted linear blend. When too few candidates overlap across
//! backends for the blend to be meaningful, fusion falls back to
//! Reciprocal Rank Fusion. Both weights and mode are overridable per
//! detected intent. Output ordering is a pure function of the inputs.

use crate::query::Intent;
use crate::retriever::Candidate;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const EPSILON: f32 = 1e-6;

/// Fusion algorithm selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMode {
    /// Weighted sum of normalized scores
    WeightedBlend,
    /// Rank-position fusion, robust to dissimilar score distributions
    ReciprocalRank,
}

/// Per-intent overrides for weights and mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<HashMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<FusionMode>,
}

/// Fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Default fusion mode
    pub mode: FusionMode,

    /// Per-backend blend weights
    #[serde(default = "default_weights")]
    pub weights: HashMap<String, f32>,

    /// Minimum cross-backend candidate overlap before falling back to RRF
    pub min_overlap: usize,

    /// RRF rank-offset constant
    pub rrf_k: f32,

    /// Percentile clip bounds for min-max normalization
    pub clip_low: f32,
    pub clip_high: f32,

    /// Intent-specific overrides
    #[serde(default = "default_intent_overrides")]
    pub intent_overrides: HashMap<Intent, IntentOverride>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            mode: FusionMode::WeightedBlend,
            weights: default_weights(),
            min_overlap: 1,
            rrf_k: 60.0,
            clip_low: 0.05,
            clip_high: 0.95,
            intent_overrides: default_intent_overrides(),
        }
    }
}

fn default_weights() -> HashMap<String, f32> {
    [
        ("lexical", 0.15),
        ("sparse", 0.5),
        ("dense", 0.35),
        ("graph", 0.2),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_intent_overrides() -> HashMap<Intent, IntentOverride> {
    // Interaction queries lean on code-linked evidence
    let mut overrides = HashMap::new();
    overrides.insert(
        Intent::Interaction,
        IntentOverride {
            weights: Some(
                [
                    ("lexical", 0.15),
                    ("sparse", 0.35),
                    ("dense", 0.25),
                    ("graph", 0.25),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ),
            mode: None,
        },
    );
    overrides
}

/// Ranked candidates from one backend, raw scores descending
#[derive(Debug, Clone)]
pub struct BackendResults {
    pub backend: String,
    pub candidates: Vec<Candidate>,
}

impl BackendResults {
    pub fn new(backend: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            backend: backend.into(),
            candidates,
        }
    }
}

/// One unit's merged scores across backends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub unit_id: String,

    /// Combined score; the ranking key
    pub fused_score: f32,

    /// Normalized per-backend scores, for explainability
    pub component_scores: BTreeMap<String, f32>,

    /// Filled in by the reranker when it runs
    pub rerank_score: Option<f32>,
}

/// Combines per-backend rankings into one
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Fuse backend candidate lists into a single descending ranking
    ///
    /// Deterministic: ties on fused score break by unit id.
    pub fn fuse(&self, intent: Intent, backends: &[BackendResults]) -> Vec<FusedResult> {
        let weights = self.weights_for(intent);
        let mode = self.mode_for(intent, backends);

        // Stage 1: normalize each backend independently
        let mut merged: AHashMap<String, FusedResult> = AHashMap::new();
        for backend in backends {
            let normalized = normalize(
                &backend.candidates,
                self.config.clip_low,
                self.config.clip_high,
            );
            for (candidate, norm) in backend.candidates.iter().zip(normalized) {
                let entry = merged
                    .entry(candidate.unit_id.clone())
                    .or_insert_with(|| FusedResult {
                        unit_id: candidate.unit_id.clone(),
                        fused_score: 0.0,
                        component_scores: BTreeMap::new(),
                        rerank_score: None,
                    });
                entry.component_scores.insert(backend.backend.clone(), norm);
            }
        }

        // Stage 2: combine
        match mode {
            FusionMode::WeightedBlend => {
                for result in merged.values_mut() {
                    result.fused_score = result
                        .component_scores
                        .iter()
                        .map(|(backend, norm)| weight_of(&weights, backend) * norm)
                        .sum();
                }
            }
            FusionMode::ReciprocalRank => {
                for backend in backends {
                    let weight = weight_of(&weights, &backend.backend);
                    for (rank, candidate) in backend.candidates.iter().enumerate() {
                        if let Some(result) = merged.get_mut(&candidate.unit_id) {
                            result.fused_score +=
                                weight / (self.config.rrf_k + rank as f32 + 1.0);
                        }
                    }
                }
            }
        }

        let mut results: Vec<FusedResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });
        results
    }

    fn weights_for(&self, intent: Intent) -> HashMap<String, f32> {
        self.config
            .intent_overrides
            .get(&intent)
            .and_then(|o| o.weights.clone())
            .unwrap_or_else(|| self.config.weights.clone())
    }

    fn mode_for(&self, intent: Intent, backends: &[BackendResults]) -> FusionMode {
        let configured = self
            .config
            .intent_overrides
            .get(&intent)
            .and_then(|o| o.mode)
            .unwrap_or(self.config.mode);

        // Robustness fallback: a weighted blend over near-disjoint candidate
        // sets degenerates to per-backend ordering, so switch to ranks
        if configured == FusionMode::WeightedBlend
            && backends.len() >= 2
            && overlap_count(backends) < self.config.min_overlap
        {
            tracing::debug!("insufficient cross-backend overlap, falling back to RRF");
            return FusionMode::ReciprocalRank;
        }
        configured
    }
}

fn weight_of(weights: &HashMap<String, f32>, backend: &str) -> f32 {
    weights.get(backend).copied().unwrap_or(0.0)
}

/// Number of unit ids returned by two or more backends
fn overlap_count(backends: &[BackendResults]) -> usize {
    let mut seen: AHashMap<&str, usize> = AHashMap::new();
    for backend in backends {
        for candidate in &backend.candidates {
            *seen.entry(candidate.unit_id.as_str()).or_insert(0) += 1;
        }
    }
    seen.values().filter(|count| **count >= 2).count()
}

/// Percentile-clipped min-max normalization onto [0,1]
///
/// Clip bounds are taken by nearest rank over the backend's own candidate
/// set, which keeps a single outlier from flattening everything else.
fn normalize(candidates: &[Candidate], clip_low: f32, clip_high: f32) -> Vec<f32> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<f32> = candidates.iter().map(|c| c.raw_score).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let lo = percentile(&sorted, clip_low);
    let hi = percentile(&sorted, clip_high);

    if (hi - lo).abs() < EPSILON {
        // Degenerate distribution: every candidate is equally strong
        return vec![1.0; candidates.len()];
    }

    candidates
        .iter()
        .map(|c| ((c.raw_score.clamp(lo, hi)) - lo) / (hi - lo))
        .collect()
}

/// Nearest-rank percentile over an ascending-sorted slice
fn percentile(sorted: &[f32], p: f32) -> f32 {
    let last = sorted.len() - 1;
    let idx = (p * last as f32).round() as usize;
    sorted[idx.min(last)]
}
