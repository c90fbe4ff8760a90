//! Configuration management
//!
//! One TOML document composed from each subsystem's settings struct, with
//! environment overrides (EVIDEX_SECTION__KEY) and validation at load time.

mod validator;

pub use validator::ConfigValidator;

use crate::cache::CacheConfig;
use crate::error::{EvidexError, Result};
use crate::fusion::FusionConfig;
use crate::passage::AssemblyConfig;
use crate::query::{CanonicalizeConfig, Intent, IntentConfig};
use crate::rerank::RerankConfig;
use crate::retriever::FieldBoosts;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub canonicalize: CanonicalizeConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Backend adapter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    pub lexical: LexicalConfig,
    #[serde(default)]
    pub dense: DenseConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

/// Lexical backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexicalConfig {
    /// Index directory
    pub index_path: PathBuf,
    #[serde(default)]
    pub boosts: FieldBoosts,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("indexes/lexical"),
            boosts: FieldBoosts::default(),
        }
    }
}

/// Dense backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseConfig {
    pub dimension: usize,
    pub ef_construction: usize,
    pub m: usize,
    pub ef_search: usize,
}

impl Default for DenseConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            ef_construction: 200,
            m: 16,
            ef_search: 64,
        }
    }
}

/// Graph backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    pub enabled: bool,

    /// Traversal bound
    pub max_hops: u32,

    /// Intents that always trigger the graph path
    #[serde(default = "default_graph_intents")]
    pub trigger_intents: Vec<Intent>,

    /// Run the graph path when primaries return fewer candidates than this
    pub min_primary_candidates: usize,
}

fn default_graph_intents() -> Vec<Intent> {
    vec![Intent::Interaction]
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hops: 2,
            trigger_intents: default_graph_intents(),
            min_primary_candidates: 5,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Budget for one adapter call
    pub adapter_timeout_ms: u64,

    /// Result count when the request leaves top_k unset
    pub default_top_k: usize,

    /// Hard ceiling on requested result count
    pub max_top_k: usize,

    /// Adapters are asked for top_k times this many candidates
    pub fan_out_multiplier: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: 1500,
            default_top_k: 20,
            max_top_k: 200,
            fan_out_multiplier: 3,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EvidexError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| EvidexError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| EvidexError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| EvidexError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: EVIDEX_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("EVIDEX_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        let parse_err = |message: String| EvidexError::InvalidConfigValue {
            path: path.to_string(),
            message,
        };
        match path {
            "SERVICE__ADAPTER_TIMEOUT_MS" => {
                self.service.adapter_timeout_ms = value
                    .parse()
                    .map_err(|_| parse_err(format!("Cannot parse '{}' as integer", value)))?;
            }
            "CACHE__TTL_SECS" => {
                self.cache.ttl_secs = value
                    .parse()
                    .map_err(|_| parse_err(format!("Cannot parse '{}' as integer", value)))?;
            }
            "CACHE__VERSION_TAG" => {
                self.cache.version_tag = value.to_string();
            }
            "RERANK__ENABLED" => {
                self.rerank.enabled = value
                    .parse()
                    .map_err(|_| parse_err(format!("Cannot parse '{}' as boolean", value)))?;
            }
            "FUSION__MIN_OVERLAP" => {
                self.fusion.min_overlap = value
                    .parse()
                    .map_err(|_| parse_err(format!("Cannot parse '{}' as integer", value)))?;
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| EvidexError::Config("Cannot determine config directory".to_string()))?;
        Ok(config_dir.join("evidex").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = Config::default();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.service.default_top_k, config.service.default_top_k);
        assert_eq!(loaded.cache.version_tag, config.cache.version_tag);
        assert_eq!(loaded.fusion.rrf_k, config.fusion.rrf_k);
    }

    #[test]
    fn missing_file_is_a_distinct_error() {
        let temp = TempDir::new().unwrap();
        let result = Config::load(&temp.path().join("nope.toml"));
        assert!(matches!(result, Err(EvidexError::ConfigNotFound { .. })));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[service]\nadapter_timeout_ms = 900\ndefault_top_k = 10\nmax_top_k = 100\nfan_out_multiplier = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.service.adapter_timeout_ms, 900);
        assert_eq!(config.cache.ttl_secs, 300);
    }
}
