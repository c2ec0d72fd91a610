//! Planflow - Plan Orchestration Engine
//!
//! Runs plans: graphs of nodes connected by adviser rules, where fork nodes
//! fan out into children that run under a concurrency limit. Every node
//! execution carries an [`Ambiance`] describing where in the plan it runs.
//!
//! # Architecture
//!
//! - [`ambiance`]: Execution context and its level stack
//! - [`plan`]: Plan definitions, YAML parsing and validation
//! - [`execution`]: Orchestration engine, step runners and fan-out scheduling
//! - [`advise`]: Adviser evaluation and dispatch
//! - [`services`]: Stores, lock service and wait/notify engine
//! - [`monitoring`]: Execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use planflow::config::EngineConfig;
//! use planflow::execution::{DryRunStepRunner, OrchestrationEngine};
//! use planflow::services::EngineServices;
//! use planflow::load_plan;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plan = load_plan("plan.yaml")?;
//!
//!     let engine = OrchestrationEngine::new(
//!         EngineServices::in_memory(),
//!         Arc::new(DryRunStepRunner),
//!         EngineConfig::default(),
//!     );
//!     let id = engine.start_plan(plan, [("accountId", "acc-1")])?;
//!     engine.run_until_complete(&id, std::time::Duration::from_secs(60))?;
//!     Ok(())
//! }
//! ```

pub mod advise;
pub mod ambiance;
pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod plan;
pub mod services;

// Re-export commonly used types
pub use ambiance::{Ambiance, Level, LogContext};
pub use error::{OrchestrationError, Result};
pub use execution::{ExecutionStatus, OrchestrationEngine};
pub use plan::{load_plan, validate_plan, Plan, PlanNode};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Planflow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Planflow");
    }

    #[test]
    fn test_module_exports_plan_node() {
        let node = PlanNode::command("build", "build", "make");
        assert_eq!(node.uuid, "build");
        assert!(node.advisers.is_empty());
    }

    #[test]
    fn test_module_exports_ambiance() {
        let ambiance = Ambiance::new("plan1", [("accountId", "a")]).unwrap();
        assert!(ambiance.levels().is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
