//! Environment context - immutable variables visible to every stage

use crate::core::error::{PipelineError, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Variables resolved once per run
///
/// The context never changes after construction. Per-stage values (an image
/// tag, a namespace) are introduced with [`EnvironmentContext::with_override`],
/// which returns a derived context and leaves the original untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentContext {
    variables: Arc<BTreeMap<String, String>>,
}

/// Builder that rejects duplicate keys
#[derive(Debug, Default)]
pub struct ContextBuilder {
    variables: BTreeMap<String, String>,
    duplicate: Option<String>,
}

impl ContextBuilder {
    /// Add a variable; adding the same key twice fails at [`ContextBuilder::build`]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if self.variables.contains_key(&key) && self.duplicate.is_none() {
            self.duplicate = Some(key.clone());
        }
        self.variables.insert(key, value.into());
        self
    }

    pub fn build(self) -> Result<EnvironmentContext> {
        if let Some(key) = self.duplicate {
            return Err(PipelineError::DuplicateVariable(key));
        }
        Ok(EnvironmentContext {
            variables: Arc::new(self.variables),
        })
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

impl EnvironmentContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Resolve a variable, failing if it is not defined
    pub fn resolve(&self, key: &str) -> Result<&str> {
        self.variables
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::UndefinedVariable(key.to_string()))
    }

    /// Look up a variable without treating absence as an error
    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    /// Derive a new context with one variable replaced or added
    pub fn with_override(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut variables = (*self.variables).clone();
        variables.insert(key.into(), value.into());
        Self {
            variables: Arc::new(variables),
        }
    }

    /// Derive a new context with several overrides applied in order
    pub fn with_overrides<I, K, V>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut variables = (*self.variables).clone();
        for (key, value) in overrides {
            variables.insert(key.into(), value.into());
        }
        Self {
            variables: Arc::new(variables),
        }
    }

    /// Render `{{ NAME }}` placeholders, failing on the first undefined name
    pub fn render(&self, template: &str) -> Result<String> {
        let mut missing = None;
        let rendered = placeholder().replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match self.variables.get(key) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(key) => Err(PipelineError::UndefinedVariable(key)),
            None => Ok(rendered.into_owned()),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.variables.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
