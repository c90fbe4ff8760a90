//! Deterministic code extraction
//!
//! A registry of pre-compiled regex recognizers, one per coding system,
//! each paired with a format-specific validity check. Built-in systems can
//! be extended from a TOML file.

use crate::error::{EvidexError, Result};
use crate::query::CodeRef;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One recognizer definition as it appears in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSystemConfig {
    /// Coding system name ("trial_registry", "icd10", ...)
    pub system: String,
    /// Match pattern; the first capture group is the code value when present
    pub pattern: String,
    #[serde(default)]
    pub description: String,
}

/// Configuration file structure for additional recognizers
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CodeSystemsFile {
    #[serde(rename = "code_system")]
    systems: Vec<CodeSystemConfig>,
}

struct CompiledRecognizer {
    system: String,
    regex: Regex,
}

/// Registry of code recognizers, applied in declaration order
pub struct CodeRegistry {
    recognizers: Vec<CompiledRecognizer>,
}

impl CodeRegistry {
    /// Built-in recognizers for the common clinical coding systems
    pub fn builtin() -> Self {
        let builtin = [
            ("trial_registry", r"\b(NCT[0-9]{8})\b"),
            ("pmid", r"\bPMID:?\s*([0-9]{4,9})\b"),
            ("doi", r"\b(10\.[0-9]{4,9}/[-._;()/:A-Za-z0-9]+)"),
            ("atc", r"\b([A-V][0-9]{2}[A-Z]{2}[0-9]{2})\b"),
            ("icd10", r"\b([A-TV-Z][0-9]{2}(?:\.[0-9A-Z]{1,4})?)\b"),
        ];

        let recognizers = builtin
            .iter()
            .map(|(system, pattern)| CompiledRecognizer {
                system: system.to_string(),
                // Patterns above are static and known-good
                regex: Regex::new(pattern).expect("builtin code pattern"),
            })
            .collect();

        Self { recognizers }
    }

    /// Build a registry from explicit configs, appended after the built-ins
    pub fn with_configs(configs: &[CodeSystemConfig]) -> Result<Self> {
        let mut registry = Self::builtin();
        for config in configs {
            let regex = Regex::new(&config.pattern).map_err(|e| {
                EvidexError::Config(format!(
                    "Invalid code pattern for system '{}': {}",
                    config.system, e
                ))
            })?;
            registry.recognizers.push(CompiledRecognizer {
                system: config.system.clone(),
                regex,
            });
        }
        Ok(registry)
    }

    /// Load additional recognizers from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvidexError::Io {
            source: e,
            context: format!("Failed to read code systems file: {:?}", path),
        })?;
        let file: CodeSystemsFile = toml::from_str(&content)?;
        Self::with_configs(&file.systems)
    }

    /// Extract all valid codes from raw text, in match order, deduplicated
    ///
    /// Extraction runs on the raw query before case normalization since
    /// code values are case-sensitive.
    pub fn extract(&self, text: &str) -> Vec<CodeRef> {
        let mut codes: Vec<CodeRef> = Vec::new();
        for recognizer in &self.recognizers {
            for captures in recognizer.regex.captures_iter(text) {
                let value = captures
                    .get(1)
                    .or_else(|| captures.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                if !validate(&recognizer.system, value) {
                    continue;
                }
                let code = CodeRef::new(recognizer.system.clone(), value);
                if !codes.contains(&code) {
                    codes.push(code);
                }
            }
        }
        codes
    }
}

/// Format-specific validity check per coding system
///
/// Unknown systems pass through unvalidated; their regex is the contract.
fn validate(system: &str, value: &str) -> bool {
    match system {
        "trial_registry" => value.len() == 11 && value.starts_with("NCT"),
        "pmid" => value.chars().all(|c| c.is_ascii_digit()),
        "doi" => value.contains('/') && !value.ends_with('.'),
        "atc" => value.len() == 7,
        "icd10" => {
            // Chapter letter plus two digits; optional subcategory
            let bytes = value.as_bytes();
            bytes.len() >= 3
                && bytes[0].is_ascii_uppercase()
                && bytes[0] != b'U'
                && bytes[1].is_ascii_digit()
                && bytes[2].is_ascii_digit()
        }
        _ => true,
    }
}
