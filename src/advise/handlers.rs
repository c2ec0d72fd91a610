//! Adviser response dispatch.

use log::{error, info};

use super::response::{AdviserResponse, EndPlanAdvise, NextStepAdvise, RetryAdvise};
use crate::ambiance::Ambiance;
use crate::error::{OrchestrationError, Result};
use crate::execution::engine::ExecutionEngine;
use crate::services::PlanExecutionService;

/// Routes an adviser response to the engine operation it asks for.
pub struct AdviseDispatcher<'a> {
    engine: &'a dyn ExecutionEngine,
    plan_store: &'a dyn PlanExecutionService,
}

impl<'a> AdviseDispatcher<'a> {
    pub fn new(engine: &'a dyn ExecutionEngine, plan_store: &'a dyn PlanExecutionService) -> Self {
        Self { engine, plan_store }
    }

    /// Acts on `response` for the node whose ambiance is `ambiance`.
    pub fn handle(&self, ambiance: &Ambiance, response: AdviserResponse) -> Result<()> {
        match response {
            AdviserResponse::NextStep(advise) => self.handle_next_step(ambiance, &advise),
            AdviserResponse::Retry(advise) => self.handle_retry(ambiance, &advise),
            AdviserResponse::EndPlan(advise) => self.handle_end_plan(ambiance, &advise),
        }
    }

    fn handle_next_step(&self, ambiance: &Ambiance, advise: &NextStepAdvise) -> Result<()> {
        let plan_execution_id = ambiance.plan_execution_id();
        let next_node = self
            .plan_store
            .fetch_execution_node(plan_execution_id, &advise.next_node_id)?;

        let Some(next_node) = next_node else {
            error!(
                "{} Next node '{}' not found in plan execution {}",
                ambiance.auto_log_context(),
                advise.next_node_id,
                plan_execution_id
            );
            return Err(OrchestrationError::node_not_found(
                plan_execution_id,
                &advise.next_node_id,
            ));
        };

        let node_execution_id = self.engine.trigger_execution(ambiance, &next_node)?;
        info!(
            "{} Advised next node '{}' as {}",
            ambiance.auto_log_context(),
            next_node.identifier,
            node_execution_id
        );
        Ok(())
    }

    fn handle_retry(&self, ambiance: &Ambiance, advise: &RetryAdvise) -> Result<()> {
        let retried = self.engine.retry_node(&advise.node_execution_id)?;
        info!(
            "{} Retrying {} as {}",
            ambiance.auto_log_context(),
            advise.node_execution_id,
            retried
        );
        Ok(())
    }

    fn handle_end_plan(&self, ambiance: &Ambiance, advise: &EndPlanAdvise) -> Result<()> {
        self.engine
            .end_plan(ambiance.plan_execution_id(), advise.status)
    }
}
