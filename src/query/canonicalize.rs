//! Query canonicalization
//!
//! Normalizes raw text, extracts deterministic codes, expands abbreviations
//! from a static table, and widens vocabulary through the concept catalog
//! collaborator. Concept lookup is fail-soft: on timeout or error the
//! expansion is skipped and the query proceeds with a warning flag.

use crate::concept::ConceptCatalog;
use crate::query::{CodeRef, CodeRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Canonicalizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalizeConfig {
    /// Hard cap on appended expansion tokens
    pub max_expansion_tokens: usize,

    /// Budget for one concept catalog call
    pub concept_timeout_ms: u64,

    /// Abbreviation table; keys are matched against all-caps raw tokens
    #[serde(default = "default_abbreviations")]
    pub abbreviations: HashMap<String, String>,
}

impl Default for CanonicalizeConfig {
    fn default() -> Self {
        Self {
            max_expansion_tokens: 20,
            concept_timeout_ms: 250,
            abbreviations: default_abbreviations(),
        }
    }
}

fn default_abbreviations() -> HashMap<String, String> {
    [
        ("HR", "hazard ratio"),
        ("OR", "odds ratio"),
        ("RR", "relative risk"),
        ("CI", "confidence interval"),
        ("MI", "myocardial infarction"),
        ("AE", "adverse event"),
        ("SAE", "serious adverse event"),
        ("AF", "atrial fibrillation"),
        ("CKD", "chronic kidney disease"),
        ("CHF", "congestive heart failure"),
        ("T2DM", "type 2 diabetes mellitus"),
        ("MACE", "major adverse cardiovascular events"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Output of canonicalization, consumed when assembling the final Query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalQuery {
    /// Normalized text
    pub text: String,

    /// Quoted phrases, required to match
    pub must_terms: Vec<String>,

    /// Remaining terms
    pub should_terms: Vec<String>,

    /// Tokens prefixed with '-', excluded from matching
    pub negative_terms: Vec<String>,

    /// Appended abbreviation and concept expansions, capped
    pub expansion_terms: Vec<String>,

    /// Codes extracted from the raw text
    pub codes: Vec<CodeRef>,

    /// Set when the concept catalog was unavailable or timed out
    pub expansion_skipped: bool,
}

/// Canonicalizes raw query text
pub struct QueryCanonicalizer {
    registry: CodeRegistry,
    catalog: Option<Arc<dyn ConceptCatalog>>,
    config: CanonicalizeConfig,
}

impl QueryCanonicalizer {
    pub fn new(
        registry: CodeRegistry,
        catalog: Option<Arc<dyn ConceptCatalog>>,
        config: CanonicalizeConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            config,
        }
    }

    /// Canonicalize one raw query
    pub async fn canonicalize(&self, raw: &str) -> CanonicalQuery {
        // Codes first: values are case-sensitive and normalization folds case
        let codes = self.registry.extract(raw);

        let (must_terms, negative_raw, remainder) = split_operators(raw);

        let mut should_terms = Vec::new();
        let mut expansion_terms = Vec::new();

        for token in remainder.split_whitespace() {
            let cleaned = trim_punctuation(token);
            if cleaned.is_empty() {
                continue;
            }
            if let Some(expanded) = self.config.abbreviations.get(cleaned) {
                push_expansion_tokens(
                    &mut expansion_terms,
                    expanded,
                    self.config.max_expansion_tokens,
                );
            }
            should_terms.push(normalize_token(cleaned));
        }

        let negative_terms: Vec<String> = negative_raw
            .iter()
            .map(|t| normalize_token(trim_punctuation(t)))
            .filter(|t| !t.is_empty())
            .collect();

        let text = should_terms.join(" ");

        let expansion_skipped = self
            .expand_concepts(&text, &mut expansion_terms)
            .await;

        CanonicalQuery {
            text,
            must_terms,
            should_terms,
            negative_terms,
            expansion_terms,
            codes,
            expansion_skipped,
        }
    }

    /// Returns true when expansion had to be skipped
    async fn expand_concepts(&self, text: &str, expansion_terms: &mut Vec<String>) -> bool {
        let Some(catalog) = &self.catalog else {
            return false;
        };
        if expansion_terms.len() >= self.config.max_expansion_tokens {
            return false;
        }

        let timeout = Duration::from_millis(self.config.concept_timeout_ms);
        match tokio::time::timeout(timeout, catalog.expand(text)).await {
            Ok(Ok(expansions)) => {
                for expansion in expansions {
                    for synonym in &expansion.synonyms {
                        push_expansion_tokens(
                            expansion_terms,
                            synonym,
                            self.config.max_expansion_tokens,
                        );
                    }
                }
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "concept catalog lookup failed, skipping expansion");
                true
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.concept_timeout_ms,
                    "concept catalog lookup timed out, skipping expansion"
                );
                true
            }
        }
    }
}

/// Pull quoted phrases (must) and '-' prefixed tokens (negative) out of the
/// raw text, returning what is left for plain tokenization
fn split_operators(raw: &str) -> (Vec<String>, Vec<String>, String) {
    let mut must = Vec::new();
    let mut negative = Vec::new();
    let mut remainder = String::new();

    let mut rest = raw;
    while let Some(open) = rest.find('"') {
        remainder.push_str(&rest[..open]);
        match rest[open + 1..].find('"') {
            Some(close) => {
                let phrase = &rest[open + 1..open + 1 + close];
                if !phrase.trim().is_empty() {
                    must.push(phrase.trim().to_lowercase());
                }
                rest = &rest[open + close + 2..];
            }
            None => {
                // Unbalanced quote is treated as literal text
                remainder.push_str(&rest[open + 1..]);
                rest = "";
            }
        }
    }
    remainder.push_str(rest);

    let mut plain = String::new();
    for token in remainder.split_whitespace() {
        if let Some(stripped) = token.strip_prefix('-') {
            if !stripped.is_empty() {
                negative.push(stripped.to_string());
                continue;
            }
        }
        plain.push_str(token);
        plain.push(' ');
    }

    (must, negative, plain)
}

/// Lowercase plain alphabetic tokens; hyphenated compounds and tokens
/// containing digits are kept verbatim
fn normalize_token(token: &str) -> String {
    if token.contains('-') || token.chars().any(|c| c.is_ascii_digit()) {
        token.to_string()
    } else {
        token.to_lowercase()
    }
}

fn trim_punctuation(token: &str) -> &str {
    token.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '!' | '?' | '(' | ')'))
}

fn push_expansion_tokens(expansion_terms: &mut Vec<String>, phrase: &str, cap: usize) {
    for token in phrase.split_whitespace() {
        if expansion_terms.len() >= cap {
            return;
        }
        let token = token.to_lowercase();
        if !expansion_terms.contains(&token) {
            expansion_terms.push(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::StaticConceptCatalog;

    fn canonicalizer(catalog: Option<Arc<dyn ConceptCatalog>>) -> QueryCanonicalizer {
        QueryCanonicalizer::new(
            CodeRegistry::builtin(),
            catalog,
            CanonicalizeConfig::default(),
        )
    }

    #[tokio::test]
    async fn lowercases_plain_tokens_preserves_compounds_and_numbers() {
        let c = canonicalizer(None);
        let q = c
            .canonicalize("Beta-Blocker Mortality 10mg p=0.05")
            .await;
        assert_eq!(q.text, "Beta-Blocker mortality 10mg p=0.05");
        assert!(!q.expansion_skipped);
    }

    #[tokio::test]
    async fn extracts_quoted_must_and_negated_terms() {
        let c = canonicalizer(None);
        let q = c
            .canonicalize("\"hazard ratio\" mortality -pediatric")
            .await;
        assert_eq!(q.must_terms, vec!["hazard ratio"]);
        assert_eq!(q.negative_terms, vec!["pediatric"]);
        assert_eq!(q.should_terms, vec!["mortality"]);
    }

    #[tokio::test]
    async fn expands_abbreviations_from_static_table() {
        let c = canonicalizer(None);
        let q = c.canonicalize("HR for mortality").await;
        assert!(q.expansion_terms.contains(&"hazard".to_string()));
        assert!(q.expansion_terms.contains(&"ratio".to_string()));
    }

    #[tokio::test]
    async fn codes_are_extracted_before_case_folding() {
        let c = canonicalizer(None);
        let q = c.canonicalize("outcomes in NCT01234567").await;
        assert_eq!(q.codes.len(), 1);
        assert_eq!(q.codes[0].value, "NCT01234567");
    }

    #[tokio::test]
    async fn concept_expansion_is_capped() {
        let mut catalog = StaticConceptCatalog::new();
        let many: Vec<String> = (0..40).map(|i| format!("synonym{}", i)).collect();
        catalog.insert("stroke", many, vec![]);

        let c = canonicalizer(Some(Arc::new(catalog)));
        let q = c.canonicalize("stroke outcomes").await;
        assert!(q.expansion_terms.len() <= 20);
        assert!(!q.expansion_skipped);
    }

    #[tokio::test]
    async fn failing_catalog_sets_skip_flag() {
        struct FailingCatalog;

        #[async_trait::async_trait]
        impl ConceptCatalog for FailingCatalog {
            async fn expand(
                &self,
                _text: &str,
            ) -> anyhow::Result<Vec<crate::concept::ConceptExpansion>> {
                anyhow::bail!("catalog offline")
            }
        }

        let c = canonicalizer(Some(Arc::new(FailingCatalog)));
        let q = c.canonicalize("stroke outcomes").await;
        assert!(q.expansion_skipped);
        assert!(q.expansion_terms.is_empty());
    }
}
