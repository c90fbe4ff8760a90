//! Intent classification
//!
//! Deterministic first pass over a priority-ordered trigger table; a
//! pluggable statistical scorer as fallback behind fixed probability
//! thresholds. Output is always non-empty.

use crate::query::Intent;
use serde::{Deserialize, Serialize};

/// One trigger rule; earlier rules win
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRule {
    pub intent: Intent,
    pub terms: Vec<String>,
}

/// Classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Minimum probability to accept the scorer's top class
    pub accept_threshold: f32,

    /// Minimum probability for an allow-listed second intent
    pub secondary_threshold: f32,

    /// Intent pairs allowed to co-occur, unordered
    #[serde(default = "default_allowed_pairs")]
    pub allowed_pairs: Vec<(Intent, Intent)>,

    /// Priority-ordered trigger table
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerRule>,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.55,
            secondary_threshold: 0.45,
            allowed_pairs: default_allowed_pairs(),
            triggers: default_triggers(),
        }
    }
}

fn default_allowed_pairs() -> Vec<(Intent, Intent)> {
    vec![
        (Intent::Efficacy, Intent::Safety),
        (Intent::Safety, Intent::Interaction),
        (Intent::Efficacy, Intent::Prognosis),
    ]
}

fn default_triggers() -> Vec<TriggerRule> {
    let rules: [(Intent, &[&str]); 5] = [
        (
            Intent::Interaction,
            &["interaction", "contraindicated", "concomitant"],
        ),
        (Intent::Dosing, &["dose", "dosage", "dosing", "titration"]),
        (
            Intent::Safety,
            &[
                "adverse",
                "side effect",
                "side effects",
                "tolerability",
                "toxicity",
            ],
        ),
        (Intent::Prognosis, &["prognosis", "natural history"]),
        (
            Intent::Efficacy,
            &[
                "hazard ratio",
                "odds ratio",
                "relative risk",
                "efficacy",
                "mortality",
            ],
        ),
    ];

    rules
        .into_iter()
        .map(|(intent, terms)| TriggerRule {
            intent,
            terms: terms.iter().map(|t| t.to_string()).collect(),
        })
        .collect()
}

/// Pluggable statistical fallback
///
/// Implementations return class probabilities; the classifier applies the
/// threshold contract. The concrete model is deliberately unspecified.
pub trait IntentScorer: Send + Sync {
    /// Probabilities per intent for the canonical text; may be empty
    fn score(&self, canonical: &str) -> Vec<(Intent, f32)>;
}

/// Lexicon-overlap scorer: hit counts normalized to probabilities
///
/// Serves as the default fallback model; replace with a trained scorer via
/// the `IntentScorer` trait without touching the threshold contract.
pub struct LexiconScorer {
    lexicon: Vec<(Intent, Vec<String>)>,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        let lexicon: [(Intent, &[&str]); 5] = [
            (
                Intent::Efficacy,
                &[
                    "outcome", "endpoint", "benefit", "reduction", "improvement", "response",
                    "survival",
                ],
            ),
            (
                Intent::Safety,
                &["harm", "risk", "event", "discontinuation", "bleeding", "warning"],
            ),
            (Intent::Dosing, &["mg", "daily", "twice", "renal", "adjustment"]),
            (
                Intent::Interaction,
                &["combined", "coadministration", "inhibitor", "inducer"],
            ),
            (
                Intent::Prognosis,
                &["progression", "recurrence", "remission", "stage"],
            ),
        ];
        Self {
            lexicon: lexicon
                .into_iter()
                .map(|(intent, terms)| {
                    (intent, terms.iter().map(|t| t.to_string()).collect())
                })
                .collect(),
        }
    }
}

impl IntentScorer for LexiconScorer {
    fn score(&self, canonical: &str) -> Vec<(Intent, f32)> {
        let tokens: Vec<&str> = canonical.split_whitespace().collect();
        let mut hits: Vec<(Intent, usize)> = Vec::new();
        for (intent, terms) in &self.lexicon {
            let count = terms
                .iter()
                .filter(|term| matches_term(&tokens, canonical, term))
                .count();
            if count > 0 {
                hits.push((*intent, count));
            }
        }
        let total: usize = hits.iter().map(|(_, c)| c).sum();
        if total == 0 {
            return Vec::new();
        }
        hits.into_iter()
            .map(|(intent, count)| (intent, count as f32 / total as f32))
            .collect()
    }
}

/// Intent classifier: trigger table first, statistical fallback second
pub struct IntentClassifier {
    config: IntentConfig,
    scorer: Option<Box<dyn IntentScorer>>,
}

impl IntentClassifier {
    pub fn new(config: IntentConfig, scorer: Option<Box<dyn IntentScorer>>) -> Self {
        Self { config, scorer }
    }

    /// Ordered (intent, confidence) list; never empty
    pub fn classify(&self, canonical: &str) -> Vec<(Intent, f32)> {
        let tokens: Vec<&str> = canonical.split_whitespace().collect();

        // Deterministic pass: first matching rule wins outright
        for rule in &self.config.triggers {
            if rule
                .terms
                .iter()
                .any(|term| matches_term(&tokens, canonical, term))
            {
                tracing::debug!(intent = %rule.intent, "trigger rule matched");
                return vec![(rule.intent, 1.0)];
            }
        }

        // Statistical fallback behind the threshold contract
        if let Some(scorer) = &self.scorer {
            let mut scored = scorer.score(canonical);
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });

            if let Some(&(top, top_p)) = scored.first() {
                if top_p >= self.config.accept_threshold {
                    let mut intents = vec![(top, top_p)];
                    if let Some(&(second, second_p)) = scored.get(1) {
                        if second_p >= self.config.secondary_threshold
                            && self.pair_allowed(top, second)
                        {
                            intents.push((second, second_p));
                        }
                    }
                    return intents;
                }
            }
        }

        vec![(Intent::Lookup, 1.0)]
    }

    fn pair_allowed(&self, a: Intent, b: Intent) -> bool {
        self.config
            .allowed_pairs
            .iter()
            .any(|&(x, y)| (x == a && y == b) || (x == b && y == a))
    }
}

/// Single-word terms must match a whole token; phrases match by containment
fn matches_term(tokens: &[&str], text: &str, term: &str) -> bool {
    if term.contains(' ') {
        text.contains(term)
    } else {
        tokens.iter().any(|t| *t == term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScorer(Vec<(Intent, f32)>);

    impl IntentScorer for FixedScorer {
        fn score(&self, _canonical: &str) -> Vec<(Intent, f32)> {
            self.0.clone()
        }
    }

    #[test]
    fn first_trigger_rule_wins() {
        let classifier = IntentClassifier::new(IntentConfig::default(), None);
        // "dose" (rule 2) and "mortality" (rule 5) both present
        let intents = classifier.classify("mortality by dose level");
        assert_eq!(intents, vec![(Intent::Dosing, 1.0)]);
    }

    #[test]
    fn hazard_ratio_query_maps_to_efficacy() {
        let classifier = IntentClassifier::new(IntentConfig::default(), None);
        let intents = classifier.classify("hazard ratio mortality drug x");
        assert_eq!(intents[0].0, Intent::Efficacy);
    }

    #[test]
    fn fallback_accepts_top_class_above_threshold() {
        let classifier = IntentClassifier::new(
            IntentConfig::default(),
            Some(Box::new(FixedScorer(vec![
                (Intent::Prognosis, 0.6),
                (Intent::Safety, 0.3),
            ]))),
        );
        let intents = classifier.classify("something unremarkable");
        assert_eq!(intents, vec![(Intent::Prognosis, 0.6)]);
    }

    #[test]
    fn fallback_below_threshold_uses_default() {
        let classifier = IntentClassifier::new(
            IntentConfig::default(),
            Some(Box::new(FixedScorer(vec![(Intent::Safety, 0.4)]))),
        );
        let intents = classifier.classify("something unremarkable");
        assert_eq!(intents, vec![(Intent::Lookup, 1.0)]);
    }

    #[test]
    fn allowed_pair_admits_second_intent() {
        let classifier = IntentClassifier::new(
            IntentConfig::default(),
            Some(Box::new(FixedScorer(vec![
                (Intent::Efficacy, 0.55),
                (Intent::Safety, 0.45),
            ]))),
        );
        let intents = classifier.classify("something unremarkable");
        assert_eq!(
            intents,
            vec![(Intent::Efficacy, 0.55), (Intent::Safety, 0.45)]
        );
    }

    #[test]
    fn disallowed_pair_is_dropped() {
        let classifier = IntentClassifier::new(
            IntentConfig::default(),
            Some(Box::new(FixedScorer(vec![
                (Intent::Dosing, 0.55),
                (Intent::Prognosis, 0.45),
            ]))),
        );
        let intents = classifier.classify("something unremarkable");
        assert_eq!(intents, vec![(Intent::Dosing, 0.55)]);
    }

    #[test]
    fn lexicon_scorer_normalizes_hit_counts() {
        let scorer = LexiconScorer::default();
        let scored = scorer.score("survival benefit and bleeding risk");
        let total: f32 = scored.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-6);
        // Efficacy has two hits, safety two; both present
        assert!(scored.iter().any(|(i, _)| *i == Intent::Efficacy));
        assert!(scored.iter().any(|(i, _)| *i == Intent::Safety));
    }

    #[test]
    fn lexicon_scorer_feeds_the_threshold_contract() {
        let classifier = IntentClassifier::new(
            IntentConfig::default(),
            Some(Box::new(LexiconScorer::default())),
        );
        // Three efficacy lexicon hits, nothing else
        let intents = classifier.classify("survival benefit improvement");
        assert_eq!(intents[0].0, Intent::Efficacy);
        assert!(intents[0].1 >= 0.55);
    }

    #[test]
    fn no_scorer_no_trigger_yields_default() {
        let classifier = IntentClassifier::new(IntentConfig::default(), None);
        let intents = classifier.classify("renin angiotensin background");
        assert_eq!(intents, vec![(Intent::Lookup, 1.0)]);
    }
}
