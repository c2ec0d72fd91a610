//! Plan Execution Store
//!
//! Keeps the plan each execution runs against, plus its overall status.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::info;
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};
use crate::execution::status::ExecutionStatus;
use crate::plan::{Plan, PlanNode};

/// One run of a plan.
#[derive(Debug, Clone)]
pub struct PlanExecution {
    pub uuid: String,
    pub plan: Plan,
    pub status: ExecutionStatus,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
}

/// Storage of plan executions and lookup of their plan nodes.
pub trait PlanExecutionService: Send + Sync {
    /// Registers a new execution of `plan` and returns its id.
    fn create(&self, plan: Plan) -> Result<String>;

    /// Resolves a static node id within a plan execution.
    fn fetch_execution_node(&self, plan_execution_id: &str, node_id: &str) -> Result<Option<PlanNode>>;

    fn get(&self, plan_execution_id: &str) -> Result<PlanExecution>;

    fn status(&self, plan_execution_id: &str) -> Result<ExecutionStatus> {
        Ok(self.get(plan_execution_id)?.status)
    }

    fn update_status(&self, plan_execution_id: &str, status: ExecutionStatus) -> Result<()>;
}

/// Plan execution store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    executions: Mutex<HashMap<String, PlanExecution>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn executions(&self) -> Result<MutexGuard<'_, HashMap<String, PlanExecution>>> {
        self.executions
            .lock()
            .map_err(|_| OrchestrationError::store("plan store lock poisoned"))
    }
}

impl PlanExecutionService for InMemoryPlanStore {
    fn create(&self, plan: Plan) -> Result<String> {
        let uuid = Uuid::new_v4().to_string();
        info!("Created plan execution {} for plan '{}'", uuid, plan.name);

        self.executions()?.insert(
            uuid.clone(),
            PlanExecution {
                uuid: uuid.clone(),
                plan,
                status: ExecutionStatus::Running,
                start_ts: Utc::now(),
                end_ts: None,
            },
        );
        Ok(uuid)
    }

    fn fetch_execution_node(&self, plan_execution_id: &str, node_id: &str) -> Result<Option<PlanNode>> {
        let executions = self.executions()?;
        let execution = executions
            .get(plan_execution_id)
            .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(plan_execution_id.to_string()))?;
        Ok(execution.plan.node(node_id).cloned())
    }

    fn get(&self, plan_execution_id: &str) -> Result<PlanExecution> {
        self.executions()?
            .get(plan_execution_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(plan_execution_id.to_string()))
    }

    fn update_status(&self, plan_execution_id: &str, status: ExecutionStatus) -> Result<()> {
        let mut executions = self.executions()?;
        let execution = executions
            .get_mut(plan_execution_id)
            .ok_or_else(|| OrchestrationError::PlanExecutionNotFound(plan_execution_id.to_string()))?;

        execution.status = status;
        if status.is_final() {
            execution.end_ts = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan::from_nodes("p", "a", vec![PlanNode::noop("a", "a")])
    }

    #[test]
    fn test_create_and_fetch_node() {
        let store = InMemoryPlanStore::new();
        let id = store.create(plan()).unwrap();

        assert_eq!(store.status(&id).unwrap(), ExecutionStatus::Running);
        assert_eq!(store.fetch_execution_node(&id, "a").unwrap().unwrap().uuid, "a");
        assert!(store.fetch_execution_node(&id, "zzz").unwrap().is_none());
    }

    #[test]
    fn test_unknown_plan_execution() {
        let store = InMemoryPlanStore::new();
        assert!(matches!(
            store.fetch_execution_node("nope", "a"),
            Err(OrchestrationError::PlanExecutionNotFound(_))
        ));
        assert!(store.update_status("nope", ExecutionStatus::Failed).is_err());
    }

    #[test]
    fn test_update_status_stamps_end() {
        let store = InMemoryPlanStore::new();
        let id = store.create(plan()).unwrap();

        store.update_status(&id, ExecutionStatus::Succeeded).unwrap();

        let execution = store.get(&id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert!(execution.end_ts.is_some());
    }
}
