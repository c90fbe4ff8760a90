//! Query model: canonicalization, code extraction, intent classification

mod canonicalize;
mod codes;
mod intent;

pub use canonicalize::{CanonicalizeConfig, CanonicalQuery, QueryCanonicalizer};
pub use codes::{CodeRegistry, CodeSystemConfig};
pub use intent::{IntentClassifier, IntentConfig, IntentScorer, LexiconScorer, TriggerRule};

use crate::corpus::FacetType;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Retrieval intent of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Efficacy outcomes: effect estimates, endpoints, comparative benefit
    Efficacy,
    /// Safety profile: adverse events, tolerability, warnings
    Safety,
    /// Dosing and administration
    Dosing,
    /// Drug-drug or drug-condition interactions
    Interaction,
    /// Prognosis and natural history
    Prognosis,
    /// Plain lookup; the default when nothing stronger is detected
    Lookup,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Efficacy => "efficacy",
            Intent::Safety => "safety",
            Intent::Dosing => "dosing",
            Intent::Interaction => "interaction",
            Intent::Prognosis => "prognosis",
            Intent::Lookup => "lookup",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed identifier extracted from query text or attached to a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRef {
    /// Coding system ("trial_registry", "icd10", "atc", "pmid", "doi")
    pub system: String,
    /// Code value, verbatim
    pub value: String,
}

impl CodeRef {
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            value: value.into(),
        }
    }
}

/// Structured filters accompanying a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilters {
    /// Restrict to one facet type
    pub facet: Option<FacetType>,

    /// Restrict to one source label (journal, registry, label)
    pub source: Option<String>,

    /// Publication date lower bound, inclusive
    pub date_from: Option<NaiveDate>,

    /// Publication date upper bound, inclusive
    pub date_to: Option<NaiveDate>,

    /// Caller-supplied codes, merged with extracted ones
    #[serde(default)]
    pub codes: Vec<CodeRef>,

    /// Minimum study sample size carried in unit metadata
    pub min_sample_size: Option<u64>,
}

/// A fully canonicalized request, immutable once constructed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Raw query text as received
    pub raw: String,

    /// Canonicalized text
    pub canonical: String,

    /// Detected intents with confidence, ordered, never empty
    pub intents: Vec<(Intent, f32)>,

    /// Terms that must match
    pub must_terms: Vec<String>,

    /// Terms that should match
    pub should_terms: Vec<String>,

    /// Terms that must not match
    pub negative_terms: Vec<String>,

    /// Expansion tokens appended by abbreviation/concept expansion
    pub expansion_terms: Vec<String>,

    /// Deterministic codes extracted from the raw text plus caller filters
    pub codes: Vec<CodeRef>,

    /// Structured filters
    pub filters: QueryFilters,

    /// Requested result count
    pub top_k: usize,

    /// Whether reranking was requested
    pub rerank: bool,

    /// Whether per-backend scores should be included
    pub explain: bool,
}

impl Query {
    /// Primary intent, guaranteed present
    pub fn primary_intent(&self) -> Intent {
        self.intents.first().map(|(i, _)| *i).unwrap_or(Intent::Lookup)
    }
}
