//! Pipeline Configuration - Explicit, Versioned Settings
//!
//! Everything that used to be ambient (prompt text, thresholds, scoring
//! weights) is a field here and is handed to the pipeline at construction.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid version string '{0}'")]
    InvalidVersion(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    #[serde(default = "default_engine_min_version")]
    pub engine_min_version: String,
    #[serde(default)]
    pub prompts: PromptTemplates,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub introspection: IntrospectionConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

fn default_config_version() -> String { crate::MIN_CONFIG_VERSION.to_string() }
fn default_engine_min_version() -> String { "1.0.0".to_string() }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            engine_min_version: default_engine_min_version(),
            prompts: PromptTemplates::default(),
            envelope: EnvelopeConfig::default(),
            validation: ValidationConfig::default(),
            introspection: IntrospectionConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Prompt texts sent to the generative model. Templates use `{{files}}`,
/// `{{context}}`, `{{follow_up}}` and `{{xml}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptTemplates {
    pub system_prompt: String,
    pub style_guide: String,
    pub initial: String,
    pub follow_up: String,
    pub correct: String,
    pub verify: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            system_prompt: "You are a diagram assistant that produces draw.io documents. \
                Reply with a single JSON object with the string fields \"xml\" and \"commentary\" \
                and nothing else. The \"xml\" field holds one complete <mxfile> document whose \
                root contains the cells with id \"0\" and id \"1\" (parent \"0\")."
                .to_string(),
            style_guide: "Use rounded rectangles for services, ellipses for start and end \
                points, rhombus shapes for decisions and plain arrows for flows. Give every \
                shape a short label and place shapes on a 10px grid."
                .to_string(),
            initial: "Create a diagram for the following material.\n\n{{files}}\nAdditional context: {{context}}"
                .to_string(),
            follow_up: "Update the previous diagram with this request: {{follow_up}}".to_string(),
            correct: "The following document is not a valid draw.io document. Return a corrected \
                version in the same JSON format.\n\n{{xml}}"
                .to_string(),
            verify: "Check that the following document matches the request and is a valid \
                draw.io document. Return it unchanged if so, otherwise return a fixed version.\n\n{{xml}}"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvelopeConfig {
    /// Accept a bare `<mxfile>` span when no envelope can be recovered.
    pub bare_markup_fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationConfig {
    pub check_edge_endpoints: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionConfig {
    #[serde(default = "default_padding")]
    pub padding: f64,
    #[serde(default = "default_simple_max")]
    pub simple_max: usize,
    #[serde(default = "default_moderate_max")]
    pub moderate_max: usize,
    #[serde(default = "default_grouping_threshold")]
    pub grouping_threshold: usize,
    #[serde(default)]
    pub link_connections: bool,
}

fn default_padding() -> f64 { 200.0 }
fn default_simple_max() -> usize { 5 }
fn default_moderate_max() -> usize { 15 }
fn default_grouping_threshold() -> usize { 10 }

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            padding: default_padding(),
            simple_max: default_simple_max(),
            moderate_max: default_moderate_max(),
            grouping_threshold: default_grouping_threshold(),
            link_connections: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringConfig {
    #[serde(default = "default_base")]
    pub base: f64,
    #[serde(default = "default_wrapper_bonus")]
    pub wrapper_bonus: f64,
    #[serde(default = "default_cell_bonus")]
    pub cell_bonus: f64,
    #[serde(default = "default_coverage_weight")]
    pub coverage_weight: f64,
    /// Shortest prompt word (in characters) that counts toward coverage.
    #[serde(default = "default_min_word_length")]
    pub min_word_length: usize,
}

fn default_base() -> f64 { 0.5 }
fn default_wrapper_bonus() -> f64 { 0.3 }
fn default_cell_bonus() -> f64 { 0.2 }
fn default_coverage_weight() -> f64 { 0.2 }
fn default_min_word_length() -> usize { 4 }

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            wrapper_bonus: default_wrapper_bonus(),
            cell_bonus: default_cell_bonus(),
            coverage_weight: default_coverage_weight(),
            min_word_length: default_min_word_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = PipelineConfig::from_json("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.introspection.padding, 200.0);
        assert_eq!(config.scoring.min_word_length, 4);
        assert!(!config.envelope.bare_markup_fallback);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"introspection": {"simpleMax": 3, "linkConnections": true}, "validation": {"checkEdgeEndpoints": true}}"#,
        )
        .unwrap();
        assert_eq!(config.introspection.simple_max, 3);
        assert_eq!(config.introspection.moderate_max, 15);
        assert!(config.introspection.link_connections);
        assert!(config.validation.check_edge_endpoints);
    }

    #[test]
    fn test_default_prompts_carry_placeholders() {
        let prompts = PromptTemplates::default();
        assert!(prompts.initial.contains("{{files}}"));
        assert!(prompts.initial.contains("{{context}}"));
        assert!(prompts.follow_up.contains("{{follow_up}}"));
        assert!(prompts.correct.contains("{{xml}}"));
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(PipelineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
