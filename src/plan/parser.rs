//! Plan Parser
//!
//! Handles loading and saving plan definitions as YAML.

use std::fs;

use log::{debug, info};

use super::model::Plan;
use super::validator::validate_plan;
use crate::error::{OrchestrationError, Result};

/// Loads a plan from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the plan structure (filling in default identifiers)
///
/// # Example
///
/// ```rust,no_run
/// use planflow::plan::load_plan;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let plan = load_plan("plan.yaml")?;
///     println!("Loaded {} nodes", plan.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_plan(path: &str) -> Result<Plan> {
    info!("Loading plan from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        OrchestrationError::InvalidPlan(format!(
            "Failed to read plan file '{}': {}. Check that the file exists and is readable.",
            path, e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_plan(&yaml_content)
}

/// Parses and validates a plan from YAML text.
pub fn parse_plan(yaml_content: &str) -> Result<Plan> {
    let mut plan: Plan = serde_yaml::from_str(yaml_content).map_err(|e| {
        OrchestrationError::InvalidPlan(format!(
            "Failed to parse plan YAML: {}. Check the file format.",
            e
        ))
    })?;

    info!(
        "Parsed plan '{}': {} nodes, start node '{}'",
        plan.name,
        plan.nodes.len(),
        plan.start_node_id
    );

    validate_plan(&mut plan)?;

    Ok(plan)
}

/// Saves a plan to a YAML file.
pub fn save_plan(plan: &Plan, path: &str) -> Result<()> {
    let yaml_content = serde_yaml::to_string(plan)?;
    fs::write(path, yaml_content)?;
    info!("Plan saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{PlanNode, StepSpec};
    use tempfile::tempdir;

    const PLAN_YAML: &str = r#"
name: demo
start: build
nodes:
  - uuid: build
    step:
      type: command
      command: echo build
    advisers:
      - type: on_success
        next_node_id: tests
  - uuid: tests
    identifier: run-tests
    step:
      type: fork
      children: [unit, lint]
      max_concurrency: 1
  - uuid: unit
    step:
      type: command
      command: echo unit
  - uuid: lint
    step:
      type: noop
"#;

    #[test]
    fn test_parse_plan() {
        let plan = parse_plan(PLAN_YAML).unwrap();

        assert_eq!(plan.name, "demo");
        assert_eq!(plan.nodes.len(), 4);
        assert_eq!(plan.node("build").unwrap().identifier, "build");
        assert_eq!(plan.node("tests").unwrap().identifier, "run-tests");
        assert_eq!(plan.node("tests").unwrap().fork_children().len(), 2);
    }

    #[test]
    fn test_parse_plan_invalid_reference() {
        let yaml = "start: a\nnodes:\n  - uuid: a\n    step: {type: noop}\n    advisers:\n      - {type: on_success, next_node_id: zzz}\n";
        let err = parse_plan(yaml).unwrap_err();
        assert!(err.to_string().contains("zzz"));
    }

    #[test]
    fn test_load_plan_file_not_found() {
        let result = load_plan("/nonexistent/path/plan.yaml");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_plan_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let plan_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&plan_path, "this is not valid yaml: [[[").unwrap();

        let result = load_plan(plan_path.to_str().unwrap());
        assert!(matches!(result, Err(OrchestrationError::InvalidPlan(_))));
    }

    #[test]
    fn test_save_and_load_plan() {
        let temp_dir = tempdir().unwrap();
        let plan_path = temp_dir.path().join("plan.yaml");

        let plan = Plan::from_nodes(
            "saved",
            "a",
            vec![
                PlanNode::command("a", "a", "echo a").on_success("b"),
                PlanNode::noop("b", "b"),
            ],
        );

        save_plan(&plan, plan_path.to_str().unwrap()).unwrap();
        let loaded = load_plan(plan_path.to_str().unwrap()).unwrap();

        assert_eq!(loaded.start_node_id, "a");
        assert_eq!(loaded.node("b").unwrap().step, StepSpec::Noop);
    }
}
