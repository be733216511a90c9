//! Credential store - secrets exposed only inside a scope

use crate::core::error::{PipelineError, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Secret material behind a credential id
///
/// Not `Serialize`; `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretMaterial {
    Token(String),
    UsernamePassword { username: String, password: String },
}

impl SecretMaterial {
    /// Values that must never show up in captured output
    pub fn secret_values(&self) -> Vec<String> {
        match self {
            SecretMaterial::Token(token) => vec![token.clone()],
            SecretMaterial::UsernamePassword { password, .. } => vec![password.clone()],
        }
    }

    /// The secret half: the token itself or the password
    pub fn secret(&self) -> &str {
        match self {
            SecretMaterial::Token(token) => token,
            SecretMaterial::UsernamePassword { password, .. } => password,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            SecretMaterial::Token(_) => None,
            SecretMaterial::UsernamePassword { username, .. } => Some(username),
        }
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretMaterial::Token(_) => f.write_str("Token(****)"),
            SecretMaterial::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .field("password", &"****")
                .finish(),
        }
    }
}

/// Where a credential comes from; read only when a scope is entered
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Literal(SecretMaterial),
    TokenEnv(String),
    UsernamePasswordEnv {
        username_env: String,
        password_env: String,
    },
    TokenFile(PathBuf),
}

impl CredentialSource {
    fn resolve(&self, id: &str) -> Result<SecretMaterial> {
        let env = |name: &str| {
            std::env::var(name).map_err(|_| PipelineError::CredentialUnavailable {
                id: id.to_string(),
                reason: format!("environment variable {} is not set", name),
            })
        };

        match self {
            CredentialSource::Literal(material) => Ok(material.clone()),
            CredentialSource::TokenEnv(name) => Ok(SecretMaterial::Token(env(name)?)),
            CredentialSource::UsernamePasswordEnv {
                username_env,
                password_env,
            } => Ok(SecretMaterial::UsernamePassword {
                username: env(username_env)?,
                password: env(password_env)?,
            }),
            CredentialSource::TokenFile(path) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    PipelineError::CredentialUnavailable {
                        id: id.to_string(),
                        reason: format!("cannot read {}: {}", path.display(), e),
                    }
                })?;
                Ok(SecretMaterial::Token(token.trim_end().to_string()))
            }
        }
    }
}

/// Handle to a resolved credential, valid until its scope ends
#[derive(Clone)]
pub struct CredentialLease {
    id: String,
    slot: Arc<RwLock<Option<SecretMaterial>>>,
}

impl CredentialLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the secret; fails once the owning scope has ended
    pub fn expose(&self) -> Result<SecretMaterial> {
        let slot = self
            .slot
            .read()
            .map_err(|_| PipelineError::CredentialExpired(self.id.clone()))?;
        slot.clone()
            .ok_or_else(|| PipelineError::CredentialExpired(self.id.clone()))
    }

    pub fn is_valid(&self) -> bool {
        self.slot.read().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

impl fmt::Debug for CredentialLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialLease")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Clears every lease slot when dropped, so the secret is gone on all exit paths
struct ScopeGuard {
    slots: Vec<Arc<RwLock<Option<SecretMaterial>>>>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Ok(mut slot) = slot.write() {
                *slot = None;
            }
        }
    }
}

/// Registry of credential sources for one run
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    sources: HashMap<String, CredentialSource>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, source: CredentialSource) {
        self.sources.insert(id.into(), source);
    }

    pub fn with(mut self, id: impl Into<String>, source: CredentialSource) -> Self {
        self.register(id, source);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    fn lease(&self, id: &str) -> Result<CredentialLease> {
        let source = self
            .sources
            .get(id)
            .ok_or_else(|| PipelineError::CredentialNotFound(id.to_string()))?;
        let material = source.resolve(id)?;
        debug!("Resolved credential {}", id);
        Ok(CredentialLease {
            id: id.to_string(),
            slot: Arc::new(RwLock::new(Some(material))),
        })
    }

    /// Run `f` with a single credential available
    ///
    /// The lease handed to `f` stops working as soon as the returned future
    /// completes or is dropped.
    pub async fn scope<F, Fut, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(CredentialLease) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lease(id)?;
        let _guard = ScopeGuard {
            slots: vec![lease.slot.clone()],
        };
        Ok(f(lease).await)
    }

    /// Run `f` with several credentials available at once
    ///
    /// Every id is resolved before `f` starts; the first failure is returned
    /// and nothing runs.
    pub async fn scope_many<F, Fut, T>(&self, ids: &[String], f: F) -> Result<T>
    where
        F: FnOnce(Vec<CredentialLease>) -> Fut,
        Fut: Future<Output = T>,
    {
        let leases = ids
            .iter()
            .map(|id| self.lease(id))
            .collect::<Result<Vec<_>>>()?;
        let _guard = ScopeGuard {
            slots: leases.iter().map(|lease| lease.slot.clone()).collect(),
        };
        Ok(f(leases).await)
    }
}
