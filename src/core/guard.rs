//! Stage guards - run-if predicates over the environment context

use crate::core::context::EnvironmentContext;
use crate::core::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Guard as written in a pipeline file (`when:`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardConfig {
    Literal(bool),
    Equals { var: String, equals: String },
    NotEquals { var: String, not_equals: String },
    Matches { var: String, matches: String },
    Defined { defined: String },
    All { all: Vec<GuardConfig> },
    Any { any: Vec<GuardConfig> },
    Not { not: Box<GuardConfig> },
}

/// Compiled guard
#[derive(Debug, Clone, Default)]
pub enum Guard {
    #[default]
    Always,
    Never,
    Equals { var: String, value: String },
    NotEquals { var: String, value: String },
    Matches { var: String, regex: Regex },
    Defined(String),
    All(Vec<Guard>),
    Any(Vec<Guard>),
    Not(Box<Guard>),
}

impl Guard {
    pub fn from_config(config: &GuardConfig) -> Result<Self> {
        Ok(match config {
            GuardConfig::Literal(true) => Guard::Always,
            GuardConfig::Literal(false) => Guard::Never,
            GuardConfig::Equals { var, equals } => Guard::Equals {
                var: var.clone(),
                value: equals.clone(),
            },
            GuardConfig::NotEquals { var, not_equals } => Guard::NotEquals {
                var: var.clone(),
                value: not_equals.clone(),
            },
            GuardConfig::Matches { var, matches } => Guard::Matches {
                var: var.clone(),
                regex: Regex::new(matches).map_err(|e| {
                    PipelineError::InvalidConfig(format!(
                        "invalid guard regex {:?}: {}",
                        matches, e
                    ))
                })?,
            },
            GuardConfig::Defined { defined } => Guard::Defined(defined.clone()),
            GuardConfig::All { all } => {
                Guard::All(all.iter().map(Guard::from_config).collect::<Result<_>>()?)
            }
            GuardConfig::Any { any } => {
                Guard::Any(any.iter().map(Guard::from_config).collect::<Result<_>>()?)
            }
            GuardConfig::Not { not } => Guard::Not(Box::new(Guard::from_config(not)?)),
        })
    }

    /// Shorthand for the common "only on this branch" guard
    pub fn equals(var: impl Into<String>, value: impl Into<String>) -> Self {
        Guard::Equals {
            var: var.into(),
            value: value.into(),
        }
    }

    /// Evaluate against a context
    ///
    /// Comparing an undefined variable is an evaluation error rather than
    /// `false`; use `Defined` to test for presence.
    pub fn evaluate(&self, ctx: &EnvironmentContext) -> Result<bool> {
        let lookup = |var: &str| {
            ctx.get(var).ok_or_else(|| {
                PipelineError::GuardEvaluationError(format!("variable {} is not defined", var))
            })
        };

        match self {
            Guard::Always => Ok(true),
            Guard::Never => Ok(false),
            Guard::Equals { var, value } => Ok(lookup(var)? == value),
            Guard::NotEquals { var, value } => Ok(lookup(var)? != value),
            Guard::Matches { var, regex } => Ok(regex.is_match(lookup(var)?)),
            Guard::Defined(var) => Ok(ctx.contains(var)),
            Guard::All(guards) => {
                for guard in guards {
                    if !guard.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Guard::Any(guards) => {
                for guard in guards {
                    if guard.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Guard::Not(guard) => Ok(!guard.evaluate(ctx)?),
        }
    }

    /// Short human-readable form used in skip reasons
    pub fn describe(&self) -> String {
        match self {
            Guard::Always => "always".to_string(),
            Guard::Never => "never".to_string(),
            Guard::Equals { var, value } => format!("{} == {}", var, value),
            Guard::NotEquals { var, value } => format!("{} != {}", var, value),
            Guard::Matches { var, regex } => format!("{} =~ /{}/", var, regex.as_str()),
            Guard::Defined(var) => format!("defined({})", var),
            Guard::All(guards) => format!(
                "all({})",
                guards.iter().map(Guard::describe).collect::<Vec<_>>().join(", ")
            ),
            Guard::Any(guards) => format!(
                "any({})",
                guards.iter().map(Guard::describe).collect::<Vec<_>>().join(", ")
            ),
            Guard::Not(guard) => format!("not({})", guard.describe()),
        }
    }
}
