//! Core domain models
//!
//! This module defines the fundamental data structures that represent
//! pipelines, stages, their actions and the records of a run.

pub mod action;
pub mod condition;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod pipeline;
pub mod stage;
pub mod state;

pub use action::{ActionKind, ActionSpec, CredentialBinding};
pub use context::*;
pub use credentials::{CredentialSource, CredentialStore, SecretMaterial};
pub use error::{PipelineError, Result};
pub use guard::Guard;
pub use pipeline::*;
pub use stage::{FailurePolicy, Stage};
pub use state::*;
