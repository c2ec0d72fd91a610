//! Ambiance Levels
//!
//! A level is one frame of the ambiance stack and identifies the scope
//! (plan, stage, step...) that is currently executing.

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// One stack frame of an [`Ambiance`](super::Ambiance).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    /// Human readable name of the scope
    pub identifier: String,

    /// Id of the node execution this frame belongs to
    pub runtime_id: String,

    /// Id of the static plan node the execution was instantiated from
    pub setup_id: String,
}

impl Level {
    /// Creates a new level. Fields are trimmed.
    pub fn new(
        identifier: impl Into<String>,
        runtime_id: impl Into<String>,
        setup_id: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into().trim().to_string(),
            runtime_id: runtime_id.into().trim().to_string(),
            setup_id: setup_id.into().trim().to_string(),
        }
    }

    /// Checks that both ids are present.
    ///
    /// An empty `identifier` is accepted; it is only used for diagnostics.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_id.is_empty() {
            return Err(OrchestrationError::InvalidLevel(format!(
                "level '{}' has no runtime id",
                self.identifier
            )));
        }
        if self.setup_id.is_empty() {
            return Err(OrchestrationError::InvalidLevel(format!(
                "level '{}' has no setup id",
                self.identifier
            )));
        }
        Ok(())
    }
}
