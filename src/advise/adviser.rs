//! Adviser evaluation: turns a finished node's adviser rules into a decision.

use log::debug;

use super::response::{AdviserResponse, AdvisingEvent};
use crate::execution::status::ExecutionStatus;
use crate::plan::{AdviserObtainment, PlanNode};

/// Returns the advise of the first adviser on `node` that applies to `event`.
///
/// `None` means the node's execution path ends here.
pub fn obtain_advise(node: &PlanNode, event: &AdvisingEvent) -> Option<AdviserResponse> {
    let advise = node
        .advisers
        .iter()
        .find_map(|adviser| evaluate(adviser, event));

    debug!(
        "{} Node '{}' finished {} -> {:?}",
        event.ambiance.auto_log_context(),
        node.identifier,
        event.status,
        advise
    );
    advise
}

fn evaluate(adviser: &AdviserObtainment, event: &AdvisingEvent) -> Option<AdviserResponse> {
    match adviser {
        AdviserObtainment::OnSuccess { next_node_id } if event.status == ExecutionStatus::Succeeded => {
            Some(AdviserResponse::next_step(next_node_id.clone()))
        }
        AdviserObtainment::OnFail { next_node_id } if event.status.is_broken() => {
            Some(AdviserResponse::next_step(next_node_id.clone()))
        }
        AdviserObtainment::Retry { max_retries }
            if event.status.is_broken() && event.retry_count < *max_retries =>
        {
            Some(AdviserResponse::retry(event.node_execution_id.clone()))
        }
        AdviserObtainment::EndPlanOnFail if event.status.is_broken() => {
            Some(AdviserResponse::end_plan(event.status))
        }
        _ => None,
    }
}
