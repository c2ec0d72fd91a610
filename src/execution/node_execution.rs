//! Node Execution Records
//!
//! The runtime record of one instantiation of a plan node, as kept by the
//! node store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::ExecutionStatus;
use crate::ambiance::Ambiance;
use crate::plan::PlanNode;

/// Runtime record of one plan node instantiation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub uuid: String,

    /// Ambiance at the time the node started; its top level is this node
    pub ambiance: Ambiance,

    /// Static node definition (absent in minimal projections)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<PlanNode>,

    pub status: ExecutionStatus,

    /// Fan-out parent, if this node runs as a child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Correlation id the node reports completion under when it has no advise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<String>,

    /// Earlier attempts of this node, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Creates a queued record.
    pub fn queued(uuid: impl Into<String>, ambiance: Ambiance, node: PlanNode) -> Self {
        Self {
            uuid: uuid.into(),
            ambiance,
            node: Some(node),
            status: ExecutionStatus::Queued,
            parent_id: None,
            notify_id: None,
            previous_id: None,
            next_id: None,
            retry_ids: Vec::new(),
            failure_message: None,
            start_ts: None,
            end_ts: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_notify_id(mut self, notify_id: Option<String>) -> Self {
        self.notify_id = notify_id;
        self
    }

    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    /// Identifier of the plan node, falling back to the setup id on the ambiance.
    pub fn identifier(&self) -> &str {
        match &self.node {
            Some(node) => &node.identifier,
            None => self
                .ambiance
                .obtain_current_level()
                .map(|level| level.identifier.as_str())
                .unwrap_or(""),
        }
    }

    /// Projects the record down to the requested fields.
    pub fn project(&self, projection: NodeProjection) -> Self {
        match projection {
            NodeProjection::Full => self.clone(),
            NodeProjection::AmbianceAndStatus => Self {
                uuid: self.uuid.clone(),
                ambiance: self.ambiance.clone(),
                node: None,
                status: self.status,
                parent_id: None,
                notify_id: None,
                previous_id: None,
                next_id: None,
                retry_ids: Vec::new(),
                failure_message: None,
                start_ts: None,
                end_ts: None,
            },
        }
    }

    /// Applies a status transition, stamping start/end times.
    pub fn transition(&mut self, status: ExecutionStatus) {
        if status == ExecutionStatus::Running && self.start_ts.is_none() {
            self.start_ts = Some(Utc::now());
        }
        if status.is_final() {
            self.end_ts = Some(Utc::now());
        }
        self.status = status;
    }
}

/// Field sets for partial node store reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeProjection {
    Full,
    /// uuid, ambiance and status only
    AmbianceAndStatus,
}
