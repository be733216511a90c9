//! Pipeline execution engine

pub mod abort;
pub mod engine;
pub mod events;
pub mod executor;
pub mod logs;

pub use abort::AbortHandle;
pub use engine::PipelineExecutor;
pub use events::{EventBus, EventHandler, ExecutionEvent};
pub use executor::{StageExecution, StageExecutor, StageOutcome};
pub use logs::StageLogWriter;
