//! Sparse neural term-expansion adapter
//!
//! Documents carry precomputed term-weight vectors (learned impact scores)
//! ingested upstream into an in-memory postings table. At query time the
//! query side is expanded by a `SparseEncoder` collaborator and matched by
//! weighted dot product. This crate never computes document-side weights.

use crate::query::Query;
use crate::retriever::{sort_candidates, AdapterError, Candidate, RetrieverAdapter, BACKEND_SPARSE};
use ahash::AHashMap;
use async_trait::async_trait;
use std::sync::Arc;

/// Query-side term expansion collaborator
#[async_trait]
pub trait SparseEncoder: Send + Sync {
    /// Expand query text into weighted terms
    async fn encode(&self, text: &str) -> anyhow::Result<Vec<(String, f32)>>;
}

/// Deterministic fallback encoder: lowercased whitespace tokens at uniform
/// weight, so retrieval still works without a learned query encoder
pub struct UniformEncoder;

#[async_trait]
impl SparseEncoder for UniformEncoder {
    async fn encode(&self, text: &str) -> anyhow::Result<Vec<(String, f32)>> {
        let mut terms: Vec<(String, f32)> = Vec::new();
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            if !terms.iter().any(|(t, _)| t == &token) {
                terms.push((token, 1.0));
            }
        }
        Ok(terms)
    }
}

/// In-memory impact postings: term -> [(unit index, weight)]
#[derive(Default)]
pub struct SparseIndex {
    postings: AHashMap<String, Vec<(u32, f32)>>,
    unit_ids: Vec<String>,
    id_lookup: AHashMap<String, u32>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest-boundary helper: register one unit's precomputed term weights
    pub fn insert(&mut self, unit_id: &str, term_weights: &[(String, f32)]) {
        let idx = match self.id_lookup.get(unit_id) {
            Some(idx) => *idx,
            None => {
                let idx = self.unit_ids.len() as u32;
                self.unit_ids.push(unit_id.to_string());
                self.id_lookup.insert(unit_id.to_string(), idx);
                idx
            }
        };
        for (term, weight) in term_weights {
            self.postings
                .entry(term.clone())
                .or_default()
                .push((idx, *weight));
        }
    }

    pub fn len(&self) -> usize {
        self.unit_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unit_ids.is_empty()
    }

    /// Dot product of the query expansion against all posting lists
    fn score(&self, query_terms: &[(String, f32)]) -> Vec<Candidate> {
        let mut scores: AHashMap<u32, f32> = AHashMap::new();
        for (term, query_weight) in query_terms {
            if let Some(postings) = self.postings.get(term) {
                for (idx, doc_weight) in postings {
                    *scores.entry(*idx).or_insert(0.0) += query_weight * doc_weight;
                }
            }
        }
        scores
            .into_iter()
            .map(|(idx, score)| Candidate::new(self.unit_ids[idx as usize].clone(), score))
            .collect()
    }
}

/// Sparse retrieval adapter
pub struct SparseAdapter {
    index: Arc<SparseIndex>,
    encoder: Arc<dyn SparseEncoder>,
}

impl SparseAdapter {
    pub fn new(index: Arc<SparseIndex>, encoder: Arc<dyn SparseEncoder>) -> Self {
        Self { index, encoder }
    }
}

#[async_trait]
impl RetrieverAdapter for SparseAdapter {
    fn name(&self) -> &str {
        BACKEND_SPARSE
    }

    async fn search(&self, query: &Query, top_k: usize) -> Result<Vec<Candidate>, AdapterError> {
        let mut text = query.canonical.clone();
        for term in &query.expansion_terms {
            text.push(' ');
            text.push_str(term);
        }

        let query_terms = self
            .encoder
            .encode(&text)
            .await
            .map_err(|e| AdapterError::Encoder(e.to_string()))?;

        let mut candidates = self.index.score(&query_terms);
        sort_candidates(&mut candidates);
        candidates.truncate(top_k);
        Ok(candidates)
    }
}
