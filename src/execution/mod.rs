//! Plan Execution Module
//!
//! Runtime side of the orchestrator: node execution records, the engine
//! that sequences them, step runners and the fan-out scheduler.
//!
//! # Architecture
//!
//! - [`engine`]: Orchestration engine and the [`ExecutionEngine`] seam
//! - [`step`]: Step runners for command nodes
//! - [`concurrency`]: Concurrency-limited fan-out of fork nodes
//! - [`node_execution`]: Node execution records
//! - [`status`]: Execution statuses

pub mod concurrency;
pub mod engine;
pub mod node_execution;
pub mod status;
pub mod step;

pub use concurrency::{ConcurrentChildScheduler, CursorAdvance, MaxConcurrentChildCallback};
pub use engine::{ExecutionEngine, OrchestrationEngine};
pub use node_execution::{NodeExecution, NodeProjection};
pub use status::ExecutionStatus;
pub use step::{CommandStepRunner, DryRunStepRunner, StepCompletion, StepOutcome, StepRunner};
