//! Configuration validation

use crate::config::Config;
use crate::error::{EvidexError, Result, ValidationError};

/// Validates a configuration before it is handed to the service
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_canonicalize(config, &mut errors);
        Self::validate_intent(config, &mut errors);
        Self::validate_fusion(config, &mut errors);
        Self::validate_rerank(config, &mut errors);
        Self::validate_assembly(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_service(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EvidexError::ConfigValidation { errors })
        }
    }

    fn validate_canonicalize(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.canonicalize.max_expansion_tokens == 0 {
            errors.push(ValidationError::new(
                "canonicalize.max_expansion_tokens",
                "must be at least 1",
            ));
        }
        if config.canonicalize.concept_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "canonicalize.concept_timeout_ms",
                "must be positive",
            ));
        }
    }

    fn validate_intent(config: &Config, errors: &mut Vec<ValidationError>) {
        let intent = &config.intent;
        if !(0.0..=1.0).contains(&intent.accept_threshold) {
            errors.push(ValidationError::new(
                "intent.accept_threshold",
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&intent.secondary_threshold) {
            errors.push(ValidationError::new(
                "intent.secondary_threshold",
                "must be within [0, 1]",
            ));
        }
        if intent.secondary_threshold > intent.accept_threshold {
            errors.push(ValidationError::new(
                "intent.secondary_threshold",
                "cannot exceed accept_threshold",
            ));
        }
    }

    fn validate_fusion(config: &Config, errors: &mut Vec<ValidationError>) {
        let fusion = &config.fusion;
        if fusion.weights.is_empty() {
            errors.push(ValidationError::new("fusion.weights", "cannot be empty"));
        }
        if fusion.weights.values().any(|w| *w < 0.0) {
            errors.push(ValidationError::new(
                "fusion.weights",
                "weights must be non-negative",
            ));
        }
        if fusion.weights.values().all(|w| *w == 0.0) {
            errors.push(ValidationError::new(
                "fusion.weights",
                "at least one weight must be positive",
            ));
        }
        if fusion.rrf_k <= 0.0 {
            errors.push(ValidationError::new("fusion.rrf_k", "must be positive"));
        }
        if !(0.0..=1.0).contains(&fusion.clip_low)
            || !(0.0..=1.0).contains(&fusion.clip_high)
            || fusion.clip_low >= fusion.clip_high
        {
            errors.push(ValidationError::new(
                "fusion.clip_low/clip_high",
                "must satisfy 0 <= clip_low < clip_high <= 1",
            ));
        }
        for (intent, override_) in &fusion.intent_overrides {
            if let Some(weights) = &override_.weights {
                if weights.values().any(|w| *w < 0.0) {
                    errors.push(ValidationError::new(
                        format!("fusion.intent_overrides.{}", intent),
                        "weights must be non-negative",
                    ));
                }
            }
        }
    }

    fn validate_rerank(config: &Config, errors: &mut Vec<ValidationError>) {
        let rerank = &config.rerank;
        if rerank.top_n == 0 {
            errors.push(ValidationError::new("rerank.top_n", "must be at least 1"));
        }
        if rerank.pin_top > rerank.top_n {
            errors.push(ValidationError::new(
                "rerank.pin_top",
                "cannot exceed top_n",
            ));
        }
        if rerank.timeout_ms == 0 {
            errors.push(ValidationError::new("rerank.timeout_ms", "must be positive"));
        }
    }

    fn validate_assembly(config: &Config, errors: &mut Vec<ValidationError>) {
        let assembly = &config.assembly;
        if assembly.window_chars == 0 {
            errors.push(ValidationError::new(
                "assembly.window_chars",
                "must be positive",
            ));
        }
        if !(-1.0..=1.0).contains(&assembly.cosine_threshold) {
            errors.push(ValidationError::new(
                "assembly.cosine_threshold",
                "must be a valid cosine within [-1, 1]",
            ));
        }
        if assembly.max_passage_chars == 0 {
            errors.push(ValidationError::new(
                "assembly.max_passage_chars",
                "must be positive",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.cache.max_entries == 0 {
            errors.push(ValidationError::new("cache.max_entries", "must be at least 1"));
        }
        if config.cache.version_tag.is_empty() {
            errors.push(ValidationError::new("cache.version_tag", "cannot be empty"));
        }
    }

    fn validate_service(config: &Config, errors: &mut Vec<ValidationError>) {
        let service = &config.service;
        if service.adapter_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "service.adapter_timeout_ms",
                "must be positive",
            ));
        }
        if service.default_top_k == 0 {
            errors.push(ValidationError::new(
                "service.default_top_k",
                "must be at least 1",
            ));
        }
        if service.default_top_k > service.max_top_k {
            errors.push(ValidationError::new(
                "service.default_top_k",
                "cannot exceed max_top_k",
            ));
        }
        if service.fan_out_multiplier == 0 {
            errors.push(ValidationError::new(
                "service.fan_out_multiplier",
                "must be at least 1",
            ));
        }
        if config.adapters.dense.dimension == 0 {
            errors.push(ValidationError::new(
                "adapters.dense.dimension",
                "must be positive",
            ));
        }
        if config.adapters.graph.max_hops == 0 {
            errors.push(ValidationError::new(
                "adapters.graph.max_hops",
                "must be at least 1",
            ));
        }
    }
}
