//! Retrieval backend adapters
//!
//! One uniform async contract over heterogeneous backends. Adapters never
//! mutate shared state, return candidates sorted descending by raw score,
//! and reserve errors strictly for connectivity/model failures: "no match"
//! is an empty list. Per-call timeouts are enforced by the orchestrator.

mod dense;
mod graph;
mod lexical;
mod sparse;

pub use dense::{DenseAdapter, DenseIndex, FastEmbedVectorizer, QueryVectorizer};
pub use graph::{ConceptGraph, GraphAdapter};
pub use lexical::{FieldBoosts, LexicalAdapter, LexicalIndexBuilder};
pub use sparse::{SparseAdapter, SparseEncoder, SparseIndex, UniformEncoder};

use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend names used in fusion weights and explain output
pub const BACKEND_LEXICAL: &str = "lexical";
pub const BACKEND_SPARSE: &str = "sparse";
pub const BACKEND_DENSE: &str = "dense";
pub const BACKEND_GRAPH: &str = "graph";

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Backend call failed: {0}")]
    Backend(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Query-side encoding failed: {0}")]
    Encoder(String),
}

/// One candidate from one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub unit_id: String,
    pub raw_score: f32,
}

impl Candidate {
    pub fn new(unit_id: impl Into<String>, raw_score: f32) -> Self {
        Self {
            unit_id: unit_id.into(),
            raw_score,
        }
    }
}

/// Uniform interface over retrieval backends
#[async_trait]
pub trait RetrieverAdapter: Send + Sync {
    /// Stable backend name, used as the fusion weight key
    fn name(&self) -> &str;

    /// Ranked candidates for the canonicalized query
    async fn search(&self, query: &Query, top_k: usize) -> Result<Vec<Candidate>, AdapterError>;
}

/// Deterministic candidate ordering: raw score descending, unit id ascending
pub(crate) fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });
}
