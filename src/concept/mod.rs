//! Concept catalog collaborator boundary
//!
//! Read-only synonym/code expansion over an external ontology service. The
//! canonicalizer calls it under a bounded timeout and skips expansion when
//! the catalog is unavailable.

use crate::query::CodeRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One expansion returned for a detected span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptExpansion {
    /// The span of query text the expansion applies to
    pub span: String,
    /// Synonym terms for the concept
    pub synonyms: Vec<String>,
    /// Coded concept identifiers
    pub codes: Vec<CodeRef>,
}

/// Read-only concept lookup service
#[async_trait]
pub trait ConceptCatalog: Send + Sync {
    /// Expand the detected concept spans of `text`; zero or more results
    async fn expand(&self, text: &str) -> anyhow::Result<Vec<ConceptExpansion>>;
}

/// In-memory catalog backed by a static term table
///
/// Spans are matched against lowercased query text by substring containment;
/// good enough for tests and offline use.
#[derive(Default)]
pub struct StaticConceptCatalog {
    entries: HashMap<String, ConceptExpansion>,
}

impl StaticConceptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        span: impl Into<String>,
        synonyms: Vec<String>,
        codes: Vec<CodeRef>,
    ) {
        let span = span.into().to_lowercase();
        self.entries.insert(
            span.clone(),
            ConceptExpansion {
                span,
                synonyms,
                codes,
            },
        );
    }
}

#[async_trait]
impl ConceptCatalog for StaticConceptCatalog {
    async fn expand(&self, text: &str) -> anyhow::Result<Vec<ConceptExpansion>> {
        let lowered = text.to_lowercase();
        let mut expansions: Vec<ConceptExpansion> = self
            .entries
            .iter()
            .filter(|(span, _)| lowered.contains(span.as_str()))
            .map(|(_, expansion)| expansion.clone())
            .collect();
        expansions.sort_by(|a, b| a.span.cmp(&b.span));
        Ok(expansions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expands_known_spans_only() {
        let mut catalog = StaticConceptCatalog::new();
        catalog.insert(
            "myocardial infarction",
            vec!["heart attack".to_string()],
            vec![CodeRef::new("icd10", "I21")],
        );
        catalog.insert("stroke", vec!["cva".to_string()], vec![]);

        let expansions = catalog
            .expand("mortality after myocardial infarction")
            .await
            .unwrap();
        assert_eq!(expansions.len(), 1);
        assert_eq!(expansions[0].synonyms, vec!["heart attack"]);
    }
}
