//! Dense vector similarity adapter
//!
//! Approximate nearest-neighbor search over fixed-dimension embeddings
//! (HNSW, cosine). Document-side vectors are precomputed upstream; the
//! query-side vector comes from a `QueryVectorizer` collaborator.

use crate::query::Query;
use crate::retriever::{sort_candidates, AdapterError, Candidate, RetrieverAdapter, BACKEND_DENSE};
use async_trait::async_trait;
use hnsw_rs::prelude::*;
use std::sync::{Arc, RwLock};

/// Query-side embedding collaborator
#[async_trait]
pub trait QueryVectorizer: Send + Sync {
    /// Embed one query text
    async fn vectorize(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embedding dimension the vectorizer produces
    fn dimension(&self) -> usize;
}

/// fastembed-backed query vectorizer (all-MiniLM-L6-v2, 384-dim)
pub struct FastEmbedVectorizer {
    model: Arc<fastembed::TextEmbedding>,
    dimension: usize,
}

impl FastEmbedVectorizer {
    pub fn new() -> anyhow::Result<Self> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        let model = fastembed::TextEmbedding::try_new(options)?;
        Ok(Self {
            model: Arc::new(model),
            dimension: 384,
        })
    }
}

#[async_trait]
impl QueryVectorizer for FastEmbedVectorizer {
    async fn vectorize(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut embeddings = self.model.embed(vec![text.to_string()], None)?;
        embeddings
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding model returned no vector"))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// HNSW index over unit embeddings with string-id mapping
pub struct DenseIndex {
    index: RwLock<Hnsw<'static, f32, DistCosine>>,
    unit_ids: RwLock<Vec<String>>,
    dimension: usize,
}

impl DenseIndex {
    /// Create an empty index
    ///
    /// `ef_construction` trades build time for recall; `m` is the per-layer
    /// connection count.
    pub fn new(dimension: usize, ef_construction: usize, m: usize) -> Self {
        let index = Hnsw::<f32, DistCosine>::new(m, dimension, ef_construction, 200, DistCosine);
        Self {
            index: RwLock::new(index),
            unit_ids: RwLock::new(Vec::new()),
            dimension,
        }
    }

    /// Ingest-boundary helper: add one precomputed unit embedding
    pub fn insert(&self, unit_id: &str, vector: &[f32]) -> Result<(), AdapterError> {
        if vector.len() != self.dimension {
            return Err(AdapterError::Index(format!(
                "Invalid dimension: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        let data = vector.to_vec();
        let mut unit_ids = self.unit_ids.write().unwrap();
        let internal_id = unit_ids.len();
        unit_ids.push(unit_id.to_string());

        let index = self.index.write().unwrap();
        index.insert((&data, internal_id));
        Ok(())
    }

    /// k nearest neighbors as (unit id, cosine similarity)
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<Candidate>, AdapterError> {
        if query.len() != self.dimension {
            return Err(AdapterError::Index(format!(
                "Invalid dimension: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let index = self.index.read().unwrap();
        let unit_ids = self.unit_ids.read().unwrap();
        let neighbors = index.search(query, k, ef_search);

        Ok(neighbors
            .into_iter()
            .filter_map(|neighbor| {
                unit_ids
                    .get(neighbor.d_id)
                    .map(|id| Candidate::new(id.clone(), 1.0 - neighbor.distance))
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.unit_ids.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Dense retrieval adapter
pub struct DenseAdapter {
    index: Arc<DenseIndex>,
    vectorizer: Arc<dyn QueryVectorizer>,
    ef_search: usize,
}

impl DenseAdapter {
    pub fn new(
        index: Arc<DenseIndex>,
        vectorizer: Arc<dyn QueryVectorizer>,
        ef_search: usize,
    ) -> Self {
        Self {
            index,
            vectorizer,
            ef_search,
        }
    }
}

#[async_trait]
impl RetrieverAdapter for DenseAdapter {
    fn name(&self) -> &str {
        BACKEND_DENSE
    }

    async fn search(&self, query: &Query, top_k: usize) -> Result<Vec<Candidate>, AdapterError> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }

        let vector = self
            .vectorizer
            .vectorize(&query.canonical)
            .await
            .map_err(|e| AdapterError::Encoder(e.to_string()))?;

        let mut candidates = self.index.search(&vector, top_k, self.ef_search)?;
        sort_candidates(&mut candidates);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Intent, QueryFilters};

    /// Deterministic toy vectorizer: axis per keyword
    struct AxisVectorizer;

    #[async_trait]
    impl QueryVectorizer for AxisVectorizer {
        async fn vectorize(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let mut v = vec![0.0f32; 8];
            if text.contains("mortality") {
                v[0] = 1.0;
            }
            if text.contains("bleeding") {
                v[1] = 1.0;
            }
            if v.iter().all(|x| *x == 0.0) {
                v[7] = 1.0;
            }
            Ok(v)
        }

        fn dimension(&self) -> usize {
            8
        }
    }

    fn axis(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[at] = 1.0;
        v
    }

    fn plain_query(text: &str) -> Query {
        Query {
            raw: text.to_string(),
            canonical: text.to_string(),
            intents: vec![(Intent::Lookup, 1.0)],
            must_terms: vec![],
            should_terms: vec![],
            negative_terms: vec![],
            expansion_terms: vec![],
            codes: vec![],
            filters: QueryFilters::default(),
            top_k: 10,
            rerank: false,
            explain: true,
        }
    }

    #[tokio::test]
    async fn nearest_unit_ranks_first() {
        let index = Arc::new(DenseIndex::new(8, 200, 16));
        index.insert("u_mortality", &axis(8, 0)).unwrap();
        index.insert("u_bleeding", &axis(8, 1)).unwrap();
        index.insert("u_other", &axis(8, 5)).unwrap();

        let adapter = DenseAdapter::new(index, Arc::new(AxisVectorizer), 64);
        let candidates = adapter
            .search(&plain_query("mortality risk"), 2)
            .await
            .unwrap();

        assert_eq!(candidates[0].unit_id, "u_mortality");
        assert!(candidates[0].raw_score > candidates[1].raw_score);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let index = Arc::new(DenseIndex::new(8, 200, 16));
        assert!(index.insert("u1", &[1.0, 2.0]).is_err());
    }

    #[tokio::test]
    async fn empty_index_returns_no_candidates() {
        let index = Arc::new(DenseIndex::new(8, 200, 16));
        let adapter = DenseAdapter::new(index, Arc::new(AxisVectorizer), 64);
        let candidates = adapter.search(&plain_query("mortality"), 5).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires model download
    async fn fastembed_vectorizer_produces_fixed_dimension() {
        let vectorizer = FastEmbedVectorizer::new().unwrap();
        let vector = vectorizer.vectorize("mortality reduction").await.unwrap();
        assert_eq!(vector.len(), vectorizer.dimension());
    }
}
