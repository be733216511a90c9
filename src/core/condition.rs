//! Output/value patterns used by guards and quality gates

use crate::core::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Pattern as written in a pipeline file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatternConfig {
    /// Plain substring
    Simple(String),
    /// `{ regex: "..." }`
    Regex { regex: String },
}

/// Compiled pattern (not serializable due to Regex)
#[derive(Debug, Clone)]
pub enum ConditionPattern {
    /// Simple string contains match
    Simple(String),
    /// Regular expression match
    Regex(Regex),
}

impl ConditionPattern {
    pub fn compile(config: &PatternConfig) -> Result<Self> {
        match config {
            PatternConfig::Simple(text) => Ok(ConditionPattern::Simple(text.clone())),
            PatternConfig::Regex { regex } => Regex::new(regex)
                .map(ConditionPattern::Regex)
                .map_err(|e| {
                    PipelineError::InvalidConfig(format!("invalid regex {:?}: {}", regex, e))
                }),
        }
    }

    /// Check if the pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        match self {
            ConditionPattern::Simple(pattern) => text.contains(pattern.as_str()),
            ConditionPattern::Regex(regex) => regex.is_match(text),
        }
    }
}

impl std::fmt::Display for ConditionPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionPattern::Simple(s) => write!(f, "{:?}", s),
            ConditionPattern::Regex(r) => write!(f, "/{}/", r.as_str()),
        }
    }
}
