//! Passage deduplication
//!
//! Collapses near-duplicate hits per (document, facet) while keeping
//! distinct facet types apart. Runs after assembly so merged passages are
//! deduplicated as single units. Keeping the first occurrence of each key
//! makes the operation idempotent and never drops a document's only hit.

use crate::corpus::FacetType;
use crate::passage::Passage;
use std::collections::HashSet;

/// Keep the highest-scoring passage per (document id, facet type)
///
/// Input is expected in descending score order; output preserves it.
pub fn deduplicate_passages(passages: Vec<Passage>) -> Vec<Passage> {
    let mut seen: HashSet<(String, FacetType)> = HashSet::new();

    passages
        .into_iter()
        .filter(|passage| seen.insert((passage.document_id.clone(), passage.facet)))
        .collect()
}
