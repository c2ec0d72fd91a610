//! Node execution status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a node execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, not started yet
    Queued,
    /// Step logic is executing
    Running,
    /// Waiting for child executions to finish
    AsyncWaiting,
    /// Finished successfully
    Succeeded,
    /// Step logic reported a failure
    Failed,
    /// Execution was torn down by the engine
    Errored,
    /// Execution was cancelled
    Aborted,
}

impl ExecutionStatus {
    /// Returns true while the node may still change status on its own.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::AsyncWaiting)
    }

    pub fn is_final(self) -> bool {
        !self.is_active()
    }

    /// Returns true for outcomes failure advisers react to.
    pub fn is_broken(self) -> bool {
        matches!(self, Self::Failed | Self::Errored)
    }

    /// Ranks final statuses for aggregation; higher is worse.
    fn severity(self) -> u8 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Errored => 2,
            Self::Aborted => 3,
            Self::Queued | Self::Running | Self::AsyncWaiting => 0,
        }
    }

    /// Derives a parent status from its children's statuses.
    ///
    /// Succeeded when every child succeeded (or there are none), otherwise
    /// the most severe of Aborted > Errored > Failed.
    pub fn aggregate<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ExecutionStatus>,
    {
        statuses
            .into_iter()
            .filter(|s| s.is_final())
            .max_by_key(|s| s.severity())
            .filter(|s| *s != Self::Succeeded)
            .unwrap_or(Self::Succeeded)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::AsyncWaiting => "ASYNC_WAITING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Errored => "ERRORED",
            Self::Aborted => "ABORTED",
        };
        write!(f, "{}", label)
    }
}
