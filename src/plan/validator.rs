//! Plan Validation
//!
//! Provides validation for plan structures including:
//! - Node field validation
//! - Reference integrity checking (advisers and fork children)
//! - Fork nesting validation (a fork may not contain itself)
//! - Reachability reporting

use std::collections::{HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{AdviserObtainment, Plan, PlanNode, StepSpec};
use crate::error::{OrchestrationError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone)]
pub enum ValidationError {
    EmptyPlan,
    DuplicateNodeId(String),
    EmptyNodeId,
    EmptyCommand(String),
    MissingStartNode(String),
    InvalidReference { node: String, reference: String },
    RecursiveFork(String),
    ZeroRetries(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPlan => write!(f, "Plan has no nodes"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::EmptyCommand(node) => write!(f, "Node '{}' has no command specified", node),
            Self::MissingStartNode(id) => write!(f, "Start node '{}' is not defined", id),
            Self::InvalidReference { node, reference } => {
                write!(f, "Node '{}' references unknown node '{}'", node, reference)
            }
            Self::RecursiveFork(node) => {
                write!(f, "Fork '{}' contains itself (directly or through nested forks)", node)
            }
            Self::ZeroRetries(node) => {
                write!(f, "Node '{}' has a retry adviser with max_retries = 0", node)
            }
        }
    }
}

/// Validates a single node's fields.
fn validate_node(node: &PlanNode) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.uuid.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors;
    }

    if let StepSpec::Command { command } = &node.step {
        if command.trim().is_empty() {
            errors.push(ValidationError::EmptyCommand(node.uuid.clone()));
        }
    }

    if let StepSpec::Fork { children, .. } = &node.step {
        if children.is_empty() {
            debug!("Fork '{}' has no children and completes immediately", node.uuid);
        }
    }

    for adviser in &node.advisers {
        if let AdviserObtainment::Retry { max_retries: 0 } = adviser {
            errors.push(ValidationError::ZeroRetries(node.uuid.clone()));
        }
    }

    if node.advisers.is_empty() {
        debug!("Node '{}' is terminal (no advisers)", node.uuid);
    }

    errors
}

/// Validates the entire plan structure.
///
/// Performs the following checks:
/// 1. Plan is not empty
/// 2. No duplicate node IDs
/// 3. All nodes have valid fields
/// 4. The start node and every referenced node exist
/// 5. No fork contains itself
///
/// Empty identifiers are filled in from the node id. Nodes that cannot be
/// reached from the start node only produce a warning.
pub fn validate_plan(plan: &mut Plan) -> Result<()> {
    info!("Validating plan with {} nodes", plan.nodes.len());

    if plan.nodes.is_empty() {
        return Err(OrchestrationError::InvalidPlan(
            ValidationError::EmptyPlan.to_string(),
        ));
    }

    for node in &mut plan.nodes {
        if node.identifier.trim().is_empty() {
            node.identifier = node.uuid.clone();
        }
    }

    let mut seen_ids: HashSet<String> = HashSet::new();
    for node in &plan.nodes {
        if !seen_ids.insert(node.uuid.clone()) {
            return Err(OrchestrationError::InvalidPlan(
                ValidationError::DuplicateNodeId(node.uuid.clone()).to_string(),
            ));
        }
    }

    let mut all_errors = Vec::new();

    if !seen_ids.contains(&plan.start_node_id) {
        all_errors.push(ValidationError::MissingStartNode(plan.start_node_id.clone()));
    }

    for node in &plan.nodes {
        all_errors.extend(validate_node(node));

        for reference in node.referenced_node_ids() {
            if !seen_ids.contains(reference) {
                all_errors.push(ValidationError::InvalidReference {
                    node: node.uuid.clone(),
                    reference: reference.to_string(),
                });
            }
        }
    }

    if all_errors.is_empty() {
        all_errors.extend(check_recursive_forks(plan));
    }

    if !all_errors.is_empty() {
        let error_messages: Vec<String> = all_errors.iter().map(|e| e.to_string()).collect();
        return Err(OrchestrationError::InvalidPlan(error_messages.join("\n")));
    }

    let reachable = reachable_from_start(plan);
    for node in &plan.nodes {
        if !reachable.contains(node.uuid.as_str()) {
            warn!("Node '{}' is not reachable from start node '{}'", node.uuid, plan.start_node_id);
        }
    }

    info!("Plan '{}' validated: {} nodes", plan.name, plan.nodes.len());
    Ok(())
}

/// Finds forks that would expand into themselves.
fn check_recursive_forks(plan: &Plan) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for fork in plan.nodes.iter().filter(|n| matches!(n.step, StepSpec::Fork { .. })) {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = fork.fork_children().iter().map(String::as_str).collect();

        while let Some(current) = queue.pop_front() {
            if current == fork.uuid {
                errors.push(ValidationError::RecursiveFork(fork.uuid.clone()));
                break;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = plan.node(current) {
                queue.extend(node.referenced_node_ids());
            }
        }
    }

    errors
}

/// Returns the ids of all nodes reachable from the start node.
fn reachable_from_start(plan: &Plan) -> HashSet<&str> {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([plan.start_node_id.as_str()]);

    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current) {
            continue;
        }
        if let Some(node) = plan.node(current) {
            queue.extend(node.referenced_node_ids());
        }
    }

    reachable
}

/// Quick validation that returns a list of error messages.
pub fn quick_validate(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();

    if plan.nodes.is_empty() {
        errors.push("Plan has no nodes".to_string());
        return errors;
    }

    let node_ids: HashSet<_> = plan.nodes.iter().map(|n| n.uuid.as_str()).collect();

    if !node_ids.contains(plan.start_node_id.as_str()) {
        errors.push(format!("Start node '{}' is not defined", plan.start_node_id));
    }

    for node in &plan.nodes {
        errors.extend(validate_node(node).iter().map(|e| e.to_string()));

        for reference in node.referenced_node_ids() {
            if !node_ids.contains(reference) {
                errors.push(format!(
                    "Node '{}': references unknown node '{}'",
                    node.uuid, reference
                ));
            }
        }
    }

    errors
}
