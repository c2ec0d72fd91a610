//! Node Store
//!
//! Persists node execution records. The engine only talks to the
//! [`NodeExecutionService`] trait; [`InMemoryNodeStore`] backs the CLI and
//! tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::error::{OrchestrationError, Result};
use crate::execution::node_execution::{NodeExecution, NodeProjection};
use crate::execution::status::ExecutionStatus;

/// Storage of node execution records.
pub trait NodeExecutionService: Send + Sync {
    /// Inserts or replaces a record.
    fn save(&self, node_execution: NodeExecution) -> Result<()>;

    /// Reads a full record.
    fn get(&self, id: &str) -> Result<NodeExecution>;

    /// Reads a partial record.
    fn get_with_fields_included(&self, id: &str, projection: NodeProjection) -> Result<NodeExecution>;

    /// Applies `ops` to the stored record and returns the result.
    fn update(&self, id: &str, ops: &mut dyn FnMut(&mut NodeExecution)) -> Result<NodeExecution>;

    /// Unconditionally moves a record to `status`.
    fn update_status(&self, id: &str, status: ExecutionStatus) -> Result<NodeExecution> {
        self.update(id, &mut |ne| ne.transition(status))
    }

    /// Atomically moves a record to `to` if its current status is in `from`.
    ///
    /// Returns `None` when the record was in some other status.
    fn transition_if(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<Option<NodeExecution>>;

    /// Moves every active descendant of `parent_id` to ERRORED.
    ///
    /// Returns the records that were transitioned.
    fn error_out_active_nodes(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    /// Returns the direct children of `parent_id`.
    fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>>;

    /// Returns every record of a plan execution.
    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>>;
}

/// Node store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    records: Mutex<HashMap<String, NodeExecution>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, NodeExecution>>> {
        self.records
            .lock()
            .map_err(|_| OrchestrationError::store("node store lock poisoned"))
    }
}

impl NodeExecutionService for InMemoryNodeStore {
    fn save(&self, node_execution: NodeExecution) -> Result<()> {
        self.records()?
            .insert(node_execution.uuid.clone(), node_execution);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<NodeExecution> {
        self.records()?
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))
    }

    fn get_with_fields_included(&self, id: &str, projection: NodeProjection) -> Result<NodeExecution> {
        self.records()?
            .get(id)
            .map(|record| record.project(projection))
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))
    }

    fn update(&self, id: &str, ops: &mut dyn FnMut(&mut NodeExecution)) -> Result<NodeExecution> {
        let mut records = self.records()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))?;
        ops(record);
        Ok(record.clone())
    }

    fn transition_if(
        &self,
        id: &str,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
    ) -> Result<Option<NodeExecution>> {
        let mut records = self.records()?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::NodeExecutionNotFound(id.to_string()))?;

        if !from.contains(&record.status) {
            return Ok(None);
        }
        record.transition(to);
        Ok(Some(record.clone()))
    }

    fn error_out_active_nodes(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        let mut records = self.records()?;

        let mut descendants: Vec<String> = Vec::new();
        let mut frontier = vec![parent_id.to_string()];
        while let Some(current) = frontier.pop() {
            for record in records.values() {
                if record.parent_id.as_deref() == Some(current.as_str()) {
                    descendants.push(record.uuid.clone());
                    frontier.push(record.uuid.clone());
                }
            }
        }

        let mut errored = Vec::new();
        for id in descendants {
            if let Some(record) = records.get_mut(&id) {
                if record.status.is_active() {
                    record.transition(ExecutionStatus::Errored);
                    record.failure_message = Some(format!("Errored out under parent '{}'", parent_id));
                    errored.push(record.clone());
                }
            }
        }

        debug!(
            "Errored out {} active nodes under parent '{}'",
            errored.len(),
            parent_id
        );
        Ok(errored)
    }

    fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
        Ok(self
            .records()?
            .values()
            .filter(|record| record.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        let mut found: Vec<NodeExecution> = self
            .records()?
            .values()
            .filter(|record| record.ambiance.plan_execution_id() == plan_execution_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.start_ts.cmp(&b.start_ts).then_with(|| a.uuid.cmp(&b.uuid)));
        Ok(found)
    }
}
