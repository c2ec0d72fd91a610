//! Error types for the orchestration engine

use thiserror::Error;

/// Result type alias using OrchestrationError
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors that can occur while sequencing node executions
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A level pushed onto an ambiance is missing a required id
    #[error("Invalid level: {0}")]
    InvalidLevel(String),

    /// An ambiance is unusable for the requested operation
    #[error("Invalid ambiance: {0}")]
    InvalidAmbiance(String),

    /// A plan node id could not be resolved within a plan execution
    #[error("Plan node '{node_id}' not found in plan execution '{plan_execution_id}'")]
    NodeNotFound {
        plan_execution_id: String,
        node_id: String,
    },

    /// No node execution record exists for the id
    #[error("Node execution not found: {0}")]
    NodeExecutionNotFound(String),

    /// No plan execution record exists for the id
    #[error("Plan execution not found: {0}")]
    PlanExecutionNotFound(String),

    /// The plan definition is malformed
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The engine configuration is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The lock service failed (as opposed to a lock that was simply busy)
    #[error("Lock service error: {0}")]
    Lock(String),

    /// A backing store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Dispatch to step logic failed
    #[error("Step dispatch failed: {0}")]
    StepDispatch(String),

    /// The plan did not reach a final status in time
    #[error("Timed out waiting for plan execution '{0}'")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Create a store error with a message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a node-not-found error
    pub fn node_not_found(plan_execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self::NodeNotFound {
            plan_execution_id: plan_execution_id.into(),
            node_id: node_id.into(),
        }
    }
}
