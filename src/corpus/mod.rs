//! Corpus data model and read-only unit stores
//!
//! Retrieval units are produced and owned by the upstream segmentation
//! pipeline; this crate only hydrates them. Unit identity is stable and
//! never reused.

mod store;

pub use store::SqliteUnitStore;

use crate::error::Result;
use crate::query::CodeRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Semantic role of a retrieval unit within its owning document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacetType {
    /// Outcome statement (efficacy endpoints, effect estimates)
    Outcome,
    /// Safety statement (adverse events, tolerability)
    Safety,
    /// Dosing or administration statement
    Dosing,
    /// Background / introduction material
    Background,
    /// Methods description
    Methods,
    /// Tabular or otherwise atomic content; never merged across
    Table,
    /// Anything else
    Other,
}

impl FacetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FacetType::Outcome => "outcome",
            FacetType::Safety => "safety",
            FacetType::Dosing => "dosing",
            FacetType::Background => "background",
            FacetType::Methods => "methods",
            FacetType::Table => "table",
            FacetType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "outcome" => FacetType::Outcome,
            "safety" => FacetType::Safety,
            "dosing" => FacetType::Dosing,
            "background" => FacetType::Background,
            "methods" => FacetType::Methods,
            "table" => FacetType::Table,
            _ => FacetType::Other,
        }
    }
}

impl std::fmt::Display for FacetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The atomic indexed item: a contiguous text span of one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalUnit {
    /// Stable unique id, assigned upstream
    pub id: String,

    /// Owning document id
    pub document_id: String,

    /// Start offset into the owning document (chars)
    pub start_char: usize,

    /// End offset into the owning document (chars, exclusive)
    pub end_char: usize,

    /// Semantic facet tag
    pub facet: FacetType,

    /// Section label within the document, when known
    pub section: Option<String>,

    /// Unit text
    pub text: String,

    /// Arbitrary upstream metadata (publication date, sample size, source)
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Read-only hydration interface over the corpus
///
/// Implementations must return units for one document in ascending
/// `start_char` order.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Fetch units by id; unknown ids are silently absent from the result
    async fn get_units(&self, ids: &[String]) -> Result<Vec<RetrievalUnit>>;

    /// All units of one document, ascending by start offset
    async fn units_for_document(&self, document_id: &str) -> Result<Vec<RetrievalUnit>>;

    /// Precomputed embedding for a unit, if one was ingested
    async fn embedding(&self, unit_id: &str) -> Result<Option<Vec<f32>>>;

    /// Deterministic codes attached to a document at ingest time
    async fn document_codes(&self, document_id: &str) -> Result<Vec<CodeRef>>;
}

/// In-memory unit store for tests and embedded use
#[derive(Default)]
pub struct MemoryUnitStore {
    units: HashMap<String, RetrievalUnit>,
    by_document: HashMap<String, Vec<String>>,
    embeddings: HashMap<String, Vec<f32>>,
    document_codes: HashMap<String, Vec<CodeRef>>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a unit, keeping the per-document ordering sorted by offset
    pub fn insert_unit(&mut self, unit: RetrievalUnit) {
        let doc_id = unit.document_id.clone();
        let unit_id = unit.id.clone();
        self.units.insert(unit_id.clone(), unit);

        let ids = self.by_document.entry(doc_id).or_default();
        if !ids.contains(&unit_id) {
            ids.push(unit_id);
        }
        let units = &self.units;
        ids.sort_by_key(|id| units.get(id).map(|u| u.start_char).unwrap_or(usize::MAX));
    }

    pub fn insert_embedding(&mut self, unit_id: impl Into<String>, vector: Vec<f32>) {
        self.embeddings.insert(unit_id.into(), vector);
    }

    pub fn insert_document_code(&mut self, document_id: impl Into<String>, code: CodeRef) {
        self.document_codes
            .entry(document_id.into())
            .or_default()
            .push(code);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn get_units(&self, ids: &[String]) -> Result<Vec<RetrievalUnit>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.units.get(id).cloned())
            .collect())
    }

    async fn units_for_document(&self, document_id: &str) -> Result<Vec<RetrievalUnit>> {
        let Some(ids) = self.by_document.get(document_id) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.units.get(id).cloned())
            .collect())
    }

    async fn embedding(&self, unit_id: &str) -> Result<Option<Vec<f32>>> {
        Ok(self.embeddings.get(unit_id).cloned())
    }

    async fn document_codes(&self, document_id: &str) -> Result<Vec<CodeRef>> {
        Ok(self
            .document_codes
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, doc: &str, start: usize, facet: FacetType) -> RetrievalUnit {
        RetrievalUnit {
            id: id.to_string(),
            document_id: doc.to_string(),
            start_char: start,
            end_char: start + 50,
            facet,
            section: None,
            text: format!("text of {}", id),
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn memory_store_orders_units_by_offset() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u2", "d1", 100, FacetType::Outcome));
        store.insert_unit(unit("u1", "d1", 0, FacetType::Background));
        store.insert_unit(unit("u3", "d1", 200, FacetType::Safety));

        let units = store.units_for_document("d1").await.unwrap();
        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2", "u3"]);
    }

    #[tokio::test]
    async fn memory_store_skips_unknown_ids() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, FacetType::Other));

        let units = store
            .get_units(&["u1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(units.len(), 1);
    }
}
