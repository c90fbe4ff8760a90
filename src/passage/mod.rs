//! Passage assembly by neighbor merging
//!
//! Top-ranked units are widened into coherent passages by merging adjacent
//! units from the same document, outward from the anchor. A neighbor must
//! sit inside the character window, must not sit across a tabular/atomic
//! boundary (unless anchor and neighbor share a section tag), and must be
//! semantically close by stored-embedding cosine. The span remap table
//! preserves per-unit offsets for downstream citation.

mod dedup;

pub use dedup::deduplicate_passages;

use crate::corpus::{FacetType, RetrievalUnit, UnitStore};
use crate::error::Result;
use crate::fusion::FusedResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Separator inserted between merged unit texts
const UNIT_SEPARATOR: &str = "\n";

/// Assembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Neighbor must start within this many chars of the anchor span
    pub window_chars: usize,

    /// Minimum embedding cosine between anchor and neighbor
    pub cosine_threshold: f32,

    /// Maximum combined passage size in chars
    pub max_passage_chars: usize,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            window_chars: 400,
            cosine_threshold: 0.6,
            max_passage_chars: 2000,
        }
    }
}

/// One contributing unit's position in the merged text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanSegment {
    pub unit_id: String,
    /// Range within the merged passage text
    pub merged_start: usize,
    pub merged_end: usize,
    /// Original range within the owning document
    pub source_start: usize,
    pub source_end: usize,
}

/// A merged excerpt of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// Contributing unit ids, ascending by source offset
    pub unit_ids: Vec<String>,
    pub document_id: String,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub span_map: Vec<SpanSegment>,
    pub facet: FacetType,
    pub fused_score: f32,
    pub component_scores: std::collections::BTreeMap<String, f32>,
    pub rerank_score: Option<f32>,
}

/// Merges ranked units into passages
pub struct PassageAssembler {
    store: Arc<dyn UnitStore>,
    config: AssemblyConfig,
}

impl PassageAssembler {
    pub fn new(store: Arc<dyn UnitStore>, config: AssemblyConfig) -> Self {
        Self { store, config }
    }

    /// Build passages for the ranked results, best first
    ///
    /// `units` is the hydrated unit map for the ranked ids. A unit consumed
    /// by a higher-ranked passage is skipped as an anchor.
    pub async fn assemble(
        &self,
        ranked: &[FusedResult],
        units: &HashMap<String, RetrievalUnit>,
    ) -> Result<Vec<Passage>> {
        let mut passages = Vec::new();
        let mut consumed: HashSet<String> = HashSet::new();
        let mut document_cache: HashMap<String, Vec<RetrievalUnit>> = HashMap::new();

        for result in ranked {
            if consumed.contains(&result.unit_id) {
                continue;
            }
            let Some(anchor) = units.get(&result.unit_id) else {
                continue;
            };

            if !document_cache.contains_key(&anchor.document_id) {
                let fetched = self.store.units_for_document(&anchor.document_id).await?;
                document_cache.insert(anchor.document_id.clone(), fetched);
            }
            let document_units = &document_cache[&anchor.document_id];

            let selected = self.merge_neighbors(anchor, document_units).await?;
            for unit in &selected {
                consumed.insert(unit.id.clone());
            }
            passages.push(build_passage(&selected, anchor, result));
        }

        Ok(passages)
    }

    /// Expand outward from the anchor, alternating right and left
    async fn merge_neighbors(
        &self,
        anchor: &RetrievalUnit,
        document_units: &[RetrievalUnit],
    ) -> Result<Vec<RetrievalUnit>> {
        let Some(anchor_idx) = document_units.iter().position(|u| u.id == anchor.id) else {
            // Anchor not in the store's view of the document; keep it alone
            return Ok(vec![anchor.clone()]);
        };

        let anchor_embedding = self.store.embedding(&anchor.id).await?;

        let mut selected: Vec<usize> = vec![anchor_idx];
        let mut total_chars = anchor.text.len();
        let mut right_edge = anchor_idx;
        let mut left_edge = anchor_idx;
        let mut right_open = true;
        let mut left_open = true;

        while right_open || left_open {
            if right_open {
                match self
                    .next_eligible(anchor, anchor_embedding.as_deref(), document_units, right_edge, 1)
                    .await?
                {
                    Some(idx) if total_chars + UNIT_SEPARATOR.len() + document_units[idx].text.len()
                        <= self.config.max_passage_chars =>
                    {
                        total_chars += UNIT_SEPARATOR.len() + document_units[idx].text.len();
                        selected.push(idx);
                        right_edge = idx;
                    }
                    _ => right_open = false,
                }
            }
            if left_open {
                match self
                    .next_eligible(anchor, anchor_embedding.as_deref(), document_units, left_edge, -1)
                    .await?
                {
                    Some(idx) if total_chars + UNIT_SEPARATOR.len() + document_units[idx].text.len()
                        <= self.config.max_passage_chars =>
                    {
                        total_chars += UNIT_SEPARATOR.len() + document_units[idx].text.len();
                        selected.push(idx);
                        left_edge = idx;
                    }
                    _ => left_open = false,
                }
            }
        }

        selected.sort_unstable();
        Ok(selected
            .into_iter()
            .map(|idx| document_units[idx].clone())
            .collect())
    }

    /// Next merge candidate from `edge` in `direction`, or None when the
    /// direction is exhausted or blocked
    async fn next_eligible(
        &self,
        anchor: &RetrievalUnit,
        anchor_embedding: Option<&[f32]>,
        document_units: &[RetrievalUnit],
        edge: usize,
        direction: i64,
    ) -> Result<Option<usize>> {
        let mut idx = edge as i64;
        let mut crossed_boundary = false;

        loop {
            idx += direction;
            if idx < 0 || idx as usize >= document_units.len() {
                return Ok(None);
            }
            let neighbor = &document_units[idx as usize];

            if neighbor.facet == FacetType::Table {
                // Atomic unit: never merged, may only be crossed
                crossed_boundary = true;
                continue;
            }

            if !self.within_window(anchor, neighbor) {
                return Ok(None);
            }

            if crossed_boundary && !same_section(anchor, neighbor) {
                return Ok(None);
            }

            let Some(anchor_embedding) = anchor_embedding else {
                return Ok(None);
            };
            let Some(neighbor_embedding) = self.store.embedding(&neighbor.id).await? else {
                return Ok(None);
            };
            if cosine(anchor_embedding, &neighbor_embedding) < self.config.cosine_threshold {
                return Ok(None);
            }

            return Ok(Some(idx as usize));
        }
    }

    fn within_window(&self, anchor: &RetrievalUnit, neighbor: &RetrievalUnit) -> bool {
        let window = self.config.window_chars;
        neighbor.start_char < anchor.end_char.saturating_add(window)
            && neighbor.end_char > anchor.start_char.saturating_sub(window)
    }
}

fn same_section(a: &RetrievalUnit, b: &RetrievalUnit) -> bool {
    match (&a.section, &b.section) {
        (Some(sa), Some(sb)) => sa == sb,
        _ => false,
    }
}

fn build_passage(selected: &[RetrievalUnit], anchor: &RetrievalUnit, result: &FusedResult) -> Passage {
    let mut text = String::new();
    let mut span_map = Vec::with_capacity(selected.len());
    let mut unit_ids = Vec::with_capacity(selected.len());

    for unit in selected {
        if !text.is_empty() {
            text.push_str(UNIT_SEPARATOR);
        }
        let merged_start = text.len();
        text.push_str(&unit.text);
        span_map.push(SpanSegment {
            unit_id: unit.id.clone(),
            merged_start,
            merged_end: text.len(),
            source_start: unit.start_char,
            source_end: unit.end_char,
        });
        unit_ids.push(unit.id.clone());
    }

    Passage {
        unit_ids,
        document_id: anchor.document_id.clone(),
        start_char: selected.first().map(|u| u.start_char).unwrap_or(0),
        end_char: selected.last().map(|u| u.end_char).unwrap_or(0),
        text,
        span_map,
        facet: anchor.facet,
        fused_score: result.fused_score,
        component_scores: result.component_scores.clone(),
        rerank_score: result.rerank_score,
    }
}

/// Cosine similarity; zero vectors score 0
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::MemoryUnitStore;
    use std::collections::BTreeMap;

    fn unit(
        id: &str,
        doc: &str,
        start: usize,
        len: usize,
        facet: FacetType,
        section: Option<&str>,
    ) -> RetrievalUnit {
        RetrievalUnit {
            id: id.to_string(),
            document_id: doc.to_string(),
            start_char: start,
            end_char: start + len,
            facet,
            section: section.map(str::to_string),
            text: "x".repeat(len),
            metadata: serde_json::Value::Null,
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

    /// 2-d vector with the given cosine against [1, 0]
    fn vec_with_cosine(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt()]
    }

    async fn assemble_one(
        store: MemoryUnitStore,
        anchor_id: &str,
    ) -> Vec<Passage> {
        let anchor_unit = store
            .get_units(&[anchor_id.to_string()])
            .await
            .unwrap()
            .remove(0);
        let units: HashMap<String, RetrievalUnit> =
            [(anchor_id.to_string(), anchor_unit)].into_iter().collect();
        let assembler = PassageAssembler::new(Arc::new(store), AssemblyConfig::default());
        assembler
            .assemble(&[fused(anchor_id, 0.9)], &units)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn merges_similar_neighbor_rejects_dissimilar() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 110, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u3", "d1", 220, 100, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec_with_cosine(0.65));
        store.insert_embedding("u3", vec_with_cosine(0.40));

        let passages = assemble_one(store, "u1").await;
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].unit_ids, vec!["u1", "u2"]);
        assert_eq!(passages[0].start_char, 0);
        assert_eq!(passages[0].end_char, 210);
    }

    #[tokio::test]
    async fn table_boundary_blocks_merge_across_sections() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("t1", "d1", 110, 50, FacetType::Table, Some("results")));
        store.insert_unit(unit("u2", "d1", 170, 100, FacetType::Outcome, Some("discussion")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec![1.0, 0.0]);

        let passages = assemble_one(store, "u1").await;
        assert_eq!(passages[0].unit_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn same_section_may_cross_table() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("t1", "d1", 110, 50, FacetType::Table, Some("results")));
        store.insert_unit(unit("u2", "d1", 170, 100, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec![1.0, 0.0]);

        let passages = assemble_one(store, "u1").await;
        // The table itself is never included
        assert_eq!(passages[0].unit_ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn respects_max_passage_size() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 900, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 910, 900, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u3", "d1", 1820, 900, FacetType::Outcome, Some("results")));
        for id in ["u1", "u2", "u3"] {
            store.insert_embedding(id, vec![1.0, 0.0]);
        }

        let passages = assemble_one(store, "u1").await;
        // u1 + u2 fits under 2000 chars, u3 would not
        assert_eq!(passages[0].unit_ids, vec!["u1", "u2"]);
        assert!(passages[0].text.len() <= 2000);
    }

    #[tokio::test]
    async fn window_limits_merge_distance() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 5000, 100, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec![1.0, 0.0]);

        let passages = assemble_one(store, "u1").await;
        assert_eq!(passages[0].unit_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn span_map_traces_back_to_source_offsets() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 40, 10, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 55, 10, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec![1.0, 0.0]);

        let passages = assemble_one(store, "u1").await;
        let passage = &passages[0];
        assert_eq!(passage.span_map.len(), 2);
        assert_eq!(passage.span_map[0].merged_start, 0);
        assert_eq!(passage.span_map[0].merged_end, 10);
        assert_eq!(passage.span_map[0].source_start, 40);
        assert_eq!(passage.span_map[1].merged_start, 11);
        assert_eq!(passage.span_map[1].merged_end, 21);
        assert_eq!(passage.span_map[1].source_start, 55);
        // Merged text and source length agree per segment
        for segment in &passage.span_map {
            assert_eq!(
                segment.merged_end - segment.merged_start,
                segment.source_end - segment.source_start
            );
        }
    }

    #[tokio::test]
    async fn missing_embedding_prevents_merge() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 110, 100, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);

        let passages = assemble_one(store, "u1").await;
        assert_eq!(passages[0].unit_ids, vec!["u1"]);
    }

    #[tokio::test]
    async fn consumed_neighbor_is_not_reanchored() {
        let mut store = MemoryUnitStore::new();
        store.insert_unit(unit("u1", "d1", 0, 100, FacetType::Outcome, Some("results")));
        store.insert_unit(unit("u2", "d1", 110, 100, FacetType::Outcome, Some("results")));
        store.insert_embedding("u1", vec![1.0, 0.0]);
        store.insert_embedding("u2", vec![1.0, 0.0]);

        let all_units: HashMap<String, RetrievalUnit> = store
            .get_units(&["u1".to_string(), "u2".to_string()])
            .await
            .unwrap()
            .into_iter()
            .map(|u| (u.id.clone(), u))
            .collect();

        let assembler = PassageAssembler::new(Arc::new(store), AssemblyConfig::default());
        let passages = assembler
            .assemble(&[fused("u1", 0.9), fused("u2", 0.5)], &all_units)
            .await
            .unwrap();

        // u2 was absorbed into u1's passage; no second passage
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].unit_ids, vec!["u1", "u2"]);
    }
}
