//! Engine configuration.
//!
//! Loaded via `figment`: defaults, overlaid by an optional TOML file, overlaid
//! by `AGG__`-prefixed environment variables (double underscore splits nested
//! keys, e.g. `AGG__FUSION__MAX_COMPLEXITY=50`).

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{AggError, AggResult};

/// Default execution mode for `aggregate`/`StreamingCollection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Standard delta-driven incremental streaming.
    Stream,
    /// Dimension-indexed refcounted aggregation, optimized for repeated
    /// evaluation of the same pipeline under changing predicates. Mirrors
    /// `Stream`'s observable output exactly; it is an internal optimization,
    /// not a distinct contract (see DESIGN.md Open Question 1).
    Toggle,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Stream
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub max_complexity: u32,
    pub max_stages_per_group: usize,
    pub enable_match_project_fusion: bool,
    pub enable_project_chain_fusion: bool,
    pub enable_sort_limit_fusion: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            max_complexity: 100,
            max_stages_per_group: 5,
            enable_match_project_fusion: true,
            enable_project_chain_fusion: true,
            enable_sort_limit_fusion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefilterConfig {
    pub enable_bloom_filter: bool,
    pub enable_trigram_regex: bool,
    pub min_collection_size: usize,
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        PrefilterConfig {
            enable_bloom_filter: true,
            enable_trigram_regex: true,
            min_collection_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_mode: ExecutionMode,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fusion: FusionConfig,
    pub prefilter: PrefilterConfig,
    pub execution: ExecutionConfig,
}

impl Config {
    /// Defaults only; never touches the filesystem or environment.
    pub fn default_config() -> Self {
        Config::default()
    }

    /// Loads configuration by merging, in order: built-in defaults,
    /// `agg.toml` (if present), then `AGG__`-prefixed environment variables.
    /// Later sources win.
    pub fn load() -> AggResult<Self> {
        Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file("agg.toml"))
            .merge(Env::prefixed("AGG__").split("__"))
            .extract()
            .map_err(|e| AggError::ParseError {
                message: format!("config error: {e}"),
            })
    }

    /// Loads configuration from a specific TOML file, still allowing env
    /// overrides on top.
    pub fn from_file(path: &str) -> AggResult<Self> {
        Figment::new()
            .merge(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AGG__").split("__"))
            .extract()
            .map_err(|e| AggError::ParseError {
                message: format!("config error: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_literals() {
        let cfg = Config::default_config();
        assert_eq!(cfg.fusion.max_complexity, 100);
        assert_eq!(cfg.fusion.max_stages_per_group, 5);
        assert_eq!(cfg.prefilter.min_collection_size, 500);
        assert_eq!(cfg.execution.default_mode, ExecutionMode::Stream);
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default_config();
        let toml_str = toml::to_string(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.fusion.max_complexity, cfg.fusion.max_complexity);
    }
}
