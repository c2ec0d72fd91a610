//! Adviser decisions.

use serde::{Deserialize, Serialize};

use crate::ambiance::Ambiance;
use crate::execution::status::ExecutionStatus;

/// Proceed to the plan node with this static id, in the same scope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NextStepAdvise {
    pub next_node_id: String,
}

/// Run the node again as a fresh execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryAdvise {
    pub node_execution_id: String,
}

/// Finish the whole plan execution with `status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndPlanAdvise {
    pub status: ExecutionStatus,
}

/// Decision produced after a node finishes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    NextStep(NextStepAdvise),
    Retry(RetryAdvise),
    EndPlan(EndPlanAdvise),
}

impl AdviserResponse {
    pub fn next_step(next_node_id: impl Into<String>) -> Self {
        Self::NextStep(NextStepAdvise {
            next_node_id: next_node_id.into(),
        })
    }

    pub fn retry(node_execution_id: impl Into<String>) -> Self {
        Self::Retry(RetryAdvise {
            node_execution_id: node_execution_id.into(),
        })
    }

    pub fn end_plan(status: ExecutionStatus) -> Self {
        Self::EndPlan(EndPlanAdvise { status })
    }
}

/// What advisers look at when a node finishes.
#[derive(Debug, Clone)]
pub struct AdvisingEvent {
    pub ambiance: Ambiance,
    pub node_execution_id: String,
    pub status: ExecutionStatus,
    /// How many times this node has already been retried
    pub retry_count: usize,
    pub failure_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        assert_eq!(
            AdviserResponse::next_step("x"),
            AdviserResponse::NextStep(NextStepAdvise {
                next_node_id: "x".to_string()
            })
        );
        assert!(matches!(AdviserResponse::retry("n1"), AdviserResponse::Retry(_)));
    }

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_string(&AdviserResponse::next_step("x")).unwrap();
        assert!(json.contains("\"type\":\"NEXT_STEP\""));
        assert!(json.contains("\"nextNodeId\":\"x\""));
    }
}
