//! Plan Data Model
//!
//! Static definitions of the nodes a plan execution walks through. Which
//! node runs after another is decided at runtime by the node's advisers.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: build-and-test
//! start: checkout
//! nodes:
//!   - uuid: checkout
//!     identifier: checkout
//!     step:
//!       type: command
//!       command: git clone https://example.com/repo.git
//!     advisers:
//!       - type: retry
//!         max_retries: 2
//!       - type: on_success
//!         next_node_id: tests
//!
//!   - uuid: tests
//!     step:
//!       type: fork
//!       children: [unit, lint, integration]
//!       max_concurrency: 2
//! ```

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a node does when it starts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    /// External step logic, handed to the configured step runner
    Command { command: String },

    /// Succeeds immediately
    Noop,

    /// Fan-out: every listed plan node runs as a child of this node, no more
    /// than `max_concurrency` at once (0 = engine default)
    Fork {
        #[serde(deserialize_with = "single_or_vec", default)]
        children: Vec<String>,
        #[serde(default)]
        max_concurrency: usize,
    },
}

/// Rule evaluated after a node finishes to decide what happens next.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserObtainment {
    /// Proceed to `next_node_id` when the node succeeded
    OnSuccess { next_node_id: String },

    /// Proceed to `next_node_id` when the node failed or errored
    OnFail { next_node_id: String },

    /// Re-run a failed node up to `max_retries` times
    Retry { max_retries: usize },

    /// End the plan with the node's status when it failed or errored
    EndPlanOnFail,
}

impl AdviserObtainment {
    /// Returns the plan node this adviser may route to.
    pub fn next_node_id(&self) -> Option<&str> {
        match self {
            Self::OnSuccess { next_node_id } | Self::OnFail { next_node_id } => {
                Some(next_node_id.as_str())
            }
            Self::Retry { .. } | Self::EndPlanOnFail => None,
        }
    }
}

/// A static node of the plan graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    /// Setup id, unique within the plan
    pub uuid: String,

    /// Human readable identifier (defaults to the uuid when loading YAML)
    #[serde(default)]
    pub identifier: String,

    /// Optional display name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub step: StepSpec,

    /// Evaluated in order; the first one that yields an advise wins
    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

impl PlanNode {
    /// Creates a node with the given step. Ids are trimmed.
    ///
    /// # Example
    ///
    /// ```
    /// use planflow::plan::PlanNode;
    ///
    /// let node = PlanNode::command("build", "build", "make all")
    ///     .on_success("test")
    ///     .with_retry(2);
    /// ```
    pub fn new(uuid: impl Into<String>, identifier: impl Into<String>, step: StepSpec) -> Self {
        Self {
            uuid: uuid.into().trim().to_string(),
            identifier: identifier.into().trim().to_string(),
            name: String::new(),
            step,
            advisers: Vec::new(),
        }
    }

    pub fn command(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self::new(
            uuid,
            identifier,
            StepSpec::Command {
                command: command.into(),
            },
        )
    }

    pub fn noop(uuid: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::new(uuid, identifier, StepSpec::Noop)
    }

    pub fn fork(
        uuid: impl Into<String>,
        identifier: impl Into<String>,
        children: Vec<String>,
        max_concurrency: usize,
    ) -> Self {
        Self::new(
            uuid,
            identifier,
            StepSpec::Fork {
                children,
                max_concurrency,
            },
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn on_success(self, next_node_id: impl Into<String>) -> Self {
        self.with_adviser(AdviserObtainment::OnSuccess {
            next_node_id: next_node_id.into(),
        })
    }

    pub fn on_fail(self, next_node_id: impl Into<String>) -> Self {
        self.with_adviser(AdviserObtainment::OnFail {
            next_node_id: next_node_id.into(),
        })
    }

    pub fn with_retry(self, max_retries: usize) -> Self {
        self.with_adviser(AdviserObtainment::Retry { max_retries })
    }

    pub fn end_plan_on_fail(self) -> Self {
        self.with_adviser(AdviserObtainment::EndPlanOnFail)
    }

    /// Returns the fork children, or an empty slice for other step kinds.
    pub fn fork_children(&self) -> &[String] {
        match &self.step {
            StepSpec::Fork { children, .. } => children,
            _ => &[],
        }
    }

    /// Returns every plan node id this node can lead to.
    pub fn referenced_node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .advisers
            .iter()
            .filter_map(AdviserObtainment::next_node_id)
            .collect();
        ids.extend(self.fork_children().iter().map(String::as_str));
        ids
    }
}

/// A complete plan: a set of nodes and the node execution starts from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    #[serde(default)]
    pub name: String,

    /// Id of the first node to trigger
    #[serde(rename = "start")]
    pub start_node_id: String,

    pub nodes: Vec<PlanNode>,
}

impl Plan {
    /// Creates an empty plan.
    pub fn new(name: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_node_id: start_node_id.into(),
            nodes: Vec::new(),
        }
    }

    /// Creates a plan from a list of nodes.
    pub fn from_nodes(
        name: impl Into<String>,
        start_node_id: impl Into<String>,
        nodes: Vec<PlanNode>,
    ) -> Self {
        Self {
            name: name.into(),
            start_node_id: start_node_id.into(),
            nodes,
        }
    }

    /// Adds a node to the plan.
    pub fn add_node(&mut self, node: PlanNode) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.uuid == node.uuid) {
            return Err(format!("Node '{}' already exists", node.uuid));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Gets a node by setup id.
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.uuid == id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start_node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builders() {
        let node = PlanNode::command(" build ", "build", "make")
            .with_name("Build")
            .with_retry(2)
            .on_success("test")
            .on_fail("cleanup");

        assert_eq!(node.uuid, "build");
        assert_eq!(node.name, "Build");
        assert_eq!(node.advisers.len(), 3);
        assert_eq!(node.referenced_node_ids(), vec!["test", "cleanup"]);
    }

    #[test]
    fn test_fork_children() {
        let node = PlanNode::fork("f", "fanout", vec!["a".into(), "b".into()], 1);
        assert_eq!(node.fork_children(), &["a".to_string(), "b".to_string()]);
        assert!(PlanNode::noop("n", "n").fork_children().is_empty());
    }

    #[test]
    fn test_plan_add_and_lookup() {
        let mut plan = Plan::new("p", "a");
        assert!(plan.add_node(PlanNode::noop("a", "a")).is_ok());
        assert!(plan.add_node(PlanNode::noop("a", "again")).is_err());

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.start_node().unwrap().uuid, "a");
        assert!(plan.node("missing").is_none());
    }

    #[test]
    fn test_deserialize_yaml() {
        let yaml = r#"
name: demo
start: a
nodes:
  - uuid: a
    step:
      type: command
      command: echo hi
    advisers:
      - type: on_success
        next_node_id: f
      - type: end_plan_on_fail
  - uuid: f
    step:
      type: fork
      children: b
      max_concurrency: 3
  - uuid: b
    step:
      type: noop
"#;
        let plan: Plan = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(plan.start_node_id, "a");
        assert_eq!(plan.nodes.len(), 3);
        assert_eq!(plan.nodes[0].advisers[1], AdviserObtainment::EndPlanOnFail);
        assert_eq!(
            plan.nodes[1].step,
            StepSpec::Fork {
                children: vec!["b".to_string()],
                max_concurrency: 3
            }
        );
        assert_eq!(plan.nodes[2].step, StepSpec::Noop);
    }

    #[test]
    fn test_deserialize_rejects_non_string_children() {
        let yaml = "type: fork\nchildren: [1, 2]\n";
        assert!(serde_yaml::from_str::<StepSpec>(yaml).is_err());
    }
}
