//! The execution context threaded through every node execution.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::level::Level;
use super::log_context::LogContext;
use crate::error::{OrchestrationError, Result};

/// Identity and scope of one logical execution path.
///
/// `setup_abstractions` are fixed for the whole plan execution and shared
/// freely. `levels` is copy-on-fork: clones share the same storage until one
/// of them pushes or pops, at which point that clone gets its own copy. A
/// mutation is therefore never visible through any other clone.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ambiance {
    setup_abstractions: Arc<BTreeMap<String, String>>,
    levels: Arc<Vec<Level>>,
    plan_execution_id: String,
}

impl Ambiance {
    /// Creates the root ambiance of a plan execution.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAmbiance` if `plan_execution_id` is empty.
    pub fn new<K, V>(
        plan_execution_id: impl Into<String>,
        setup_abstractions: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let plan_execution_id = plan_execution_id.into().trim().to_string();
        if plan_execution_id.is_empty() {
            return Err(OrchestrationError::InvalidAmbiance(
                "plan execution id is required".to_string(),
            ));
        }

        Ok(Self {
            setup_abstractions: Arc::new(
                setup_abstractions
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
            levels: Arc::new(Vec::new()),
            plan_execution_id,
        })
    }

    pub fn plan_execution_id(&self) -> &str {
        &self.plan_execution_id
    }

    pub fn setup_abstractions(&self) -> &BTreeMap<String, String> {
        &self.setup_abstractions
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    /// Returns the level stack, outermost scope first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Derives the diagnostic key/value set for this execution path.
    ///
    /// Contains every setup abstraction, the plan execution id, and the
    /// identifiers of the top level.
    pub fn auto_log_context(&self) -> LogContext {
        let mut ctx = LogContext::new();
        for (key, value) in self.setup_abstractions.iter() {
            ctx.insert(key.clone(), value.clone());
        }
        ctx.insert("planExecutionId", self.plan_execution_id.clone());
        // Deeper levels overwrite shallower ones; the top of the stack wins.
        for level in self.levels.iter() {
            ctx.insert("identifier", level.identifier.clone());
            ctx.insert("runtimeId", level.runtime_id.clone());
            ctx.insert("setupId", level.setup_id.clone());
        }
        ctx
    }

    /// Pushes a validated level onto the stack.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLevel` if the level has no runtime id or setup id. The
    /// stack is left untouched in that case.
    pub fn add_level(&mut self, level: Level) -> Result<()> {
        level.validate()?;
        Arc::make_mut(&mut self.levels).push(level);
        Ok(())
    }

    /// Returns an independent copy for a new execution path.
    pub fn clone_for_child(&self) -> Self {
        self.clone()
    }

    /// Returns a copy with the top level removed.
    ///
    /// Used when an execution path hands control back to its parent scope.
    /// An empty stack yields an empty copy.
    pub fn clone_for_finish(&self) -> Self {
        let mut cloned = self.clone();
        if !cloned.levels.is_empty() {
            Arc::make_mut(&mut cloned.levels).pop();
        }
        cloned
    }

    /// Returns a child copy with `level` pushed on top.
    pub fn with_level(&self, level: Level) -> Result<Self> {
        let mut child = self.clone_for_child();
        child.add_level(level)?;
        Ok(child)
    }

    pub fn obtain_current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn obtain_current_runtime_id(&self) -> Option<&str> {
        self.obtain_current_level().map(|level| level.runtime_id.as_str())
    }
}
