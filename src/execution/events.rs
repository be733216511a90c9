//! Execution events for console rendering and observers

use crate::core::{RunStatus, StageStatus};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Events that can occur during pipeline execution
///
/// Command lines are rendered through the scope's masker before they get here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline: String,
        build_number: Option<u64>,
        stages: usize,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    ActionStarted {
        stage: String,
        action: String,
        command: String,
    },
    ActionFinished {
        stage: String,
        action: String,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
    },
    StageFinished {
        stage: String,
        status: StageStatus,
        duration_ms: u64,
    },
    PipelineFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(Arc::new(handler));
        }
    }

    /// Emit an event to all handlers
    pub fn emit(&self, event: ExecutionEvent) {
        // Clone the list so a handler may subscribe without deadlocking
        let handlers = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.lock().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("handlers", &count).finish()
    }
}
