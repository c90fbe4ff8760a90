//! Graph-assisted retrieval adapter
//!
//! Bounded multi-hop traversal over a code/document graph built at ingest
//! time: codes link to the documents that carry them, documents link back
//! to their codes. Seeded from the query's deterministic codes; raw score
//! decays with hop distance so fusion normalization keeps it comparable.

use crate::query::{CodeRef, Query};
use crate::retriever::{sort_candidates, AdapterError, Candidate, RetrieverAdapter, BACKEND_GRAPH};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Code/document adjacency, read-only at query time
#[derive(Default)]
pub struct ConceptGraph {
    code_documents: HashMap<CodeRef, HashSet<String>>,
    document_codes: HashMap<String, HashSet<CodeRef>>,
    document_units: HashMap<String, Vec<String>>,
}

impl ConceptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest-boundary helper: link a code to a document
    pub fn link(&mut self, code: CodeRef, document_id: impl Into<String>) {
        let document_id = document_id.into();
        self.code_documents
            .entry(code.clone())
            .or_default()
            .insert(document_id.clone());
        self.document_codes
            .entry(document_id)
            .or_default()
            .insert(code);
    }

    /// Ingest-boundary helper: attach a unit to its document
    pub fn attach_unit(&mut self, document_id: impl Into<String>, unit_id: impl Into<String>) {
        self.document_units
            .entry(document_id.into())
            .or_default()
            .push(unit_id.into());
    }

    /// Breadth-first expansion from seed codes, bounded by `max_hops`
    ///
    /// Returns (unit id, hop distance) with each unit recorded at its first
    /// (smallest) hop.
    pub fn traverse(&self, seeds: &[CodeRef], max_hops: u32) -> Vec<(String, u32)> {
        let mut frontier: HashSet<CodeRef> = seeds.iter().cloned().collect();
        let mut seen_codes = frontier.clone();
        let mut seen_documents: HashSet<String> = HashSet::new();
        let mut units: Vec<(String, u32)> = Vec::new();

        for hop in 1..=max_hops {
            if frontier.is_empty() {
                break;
            }

            let mut reached_documents: Vec<&String> = frontier
                .iter()
                .filter_map(|code| self.code_documents.get(code))
                .flatten()
                .filter(|doc| !seen_documents.contains(*doc))
                .collect();
            reached_documents.sort();
            reached_documents.dedup();

            let mut next_frontier: HashSet<CodeRef> = HashSet::new();
            for document_id in reached_documents {
                seen_documents.insert(document_id.clone());
                if let Some(unit_ids) = self.document_units.get(document_id) {
                    for unit_id in unit_ids {
                        units.push((unit_id.clone(), hop));
                    }
                }
                if let Some(codes) = self.document_codes.get(document_id) {
                    for code in codes {
                        if seen_codes.insert(code.clone()) {
                            next_frontier.insert(code.clone());
                        }
                    }
                }
            }
            frontier = next_frontier;
        }

        units
    }
}

/// Graph retrieval adapter
pub struct GraphAdapter {
    graph: Arc<ConceptGraph>,
    max_hops: u32,
}

impl GraphAdapter {
    pub fn new(graph: Arc<ConceptGraph>, max_hops: u32) -> Self {
        Self { graph, max_hops }
    }
}

#[async_trait]
impl RetrieverAdapter for GraphAdapter {
    fn name(&self) -> &str {
        BACKEND_GRAPH
    }

    async fn search(&self, query: &Query, top_k: usize) -> Result<Vec<Candidate>, AdapterError> {
        let mut seeds = query.codes.clone();
        for code in &query.filters.codes {
            if !seeds.contains(code) {
                seeds.push(code.clone());
            }
        }
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let reached = self.graph.traverse(&seeds, self.max_hops);
        let mut candidates: Vec<Candidate> = reached
            .into_iter()
            .map(|(unit_id, hop)| Candidate::new(unit_id, 1.0 / hop as f32))
            .collect();

        sort_candidates(&mut candidates);
        candidates.truncate(top_k);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Intent, QueryFilters};

    fn code(system: &str, value: &str) -> CodeRef {
        CodeRef::new(system, value)
    }

    fn sample_graph() -> ConceptGraph {
        let mut graph = ConceptGraph::new();
        // d1 carries the trial id and an ICD code
        graph.link(code("trial_registry", "NCT01234567"), "d1");
        graph.link(code("icd10", "I21"), "d1");
        graph.attach_unit("d1", "u1");
        graph.attach_unit("d1", "u2");
        // d2 shares the ICD code; reachable at hop 2
        graph.link(code("icd10", "I21"), "d2");
        graph.attach_unit("d2", "u3");
        // d3 is unconnected
        graph.link(code("icd10", "E11"), "d3");
        graph.attach_unit("d3", "u4");
        graph
    }

    fn query_with_codes(codes: Vec<CodeRef>) -> Query {
        Query {
            raw: String::new(),
            canonical: String::new(),
            intents: vec![(Intent::Lookup, 1.0)],
            must_terms: vec![],
            should_terms: vec![],
            negative_terms: vec![],
            expansion_terms: vec![],
            codes,
            filters: QueryFilters::default(),
            top_k: 10,
            rerank: false,
            explain: true,
        }
    }

    #[tokio::test]
    async fn one_hop_reaches_direct_documents() {
        let adapter = GraphAdapter::new(Arc::new(sample_graph()), 1);
        let query = query_with_codes(vec![code("trial_registry", "NCT01234567")]);
        let candidates = adapter.search(&query, 10).await.unwrap();

        let ids: Vec<&str> = candidates.iter().map(|c| c.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert!(candidates.iter().all(|c| c.raw_score == 1.0));
    }

    #[tokio::test]
    async fn second_hop_scores_lower() {
        let adapter = GraphAdapter::new(Arc::new(sample_graph()), 2);
        let query = query_with_codes(vec![code("trial_registry", "NCT01234567")]);
        let candidates = adapter.search(&query, 10).await.unwrap();

        let u3 = candidates.iter().find(|c| c.unit_id == "u3").unwrap();
        assert_eq!(u3.raw_score, 0.5);
        assert!(!candidates.iter().any(|c| c.unit_id == "u4"));
    }

    #[tokio::test]
    async fn no_seed_codes_yields_empty() {
        let adapter = GraphAdapter::new(Arc::new(sample_graph()), 2);
        let candidates = adapter
            .search(&query_with_codes(vec![]), 10)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
