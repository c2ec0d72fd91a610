//! Step Execution
//!
//! Runs the work behind a command node and reports the outcome back to the
//! engine over its completion channel. The engine never blocks on a step:
//! runners either finish immediately (dry run) or hand the work to a worker
//! thread.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::mpsc::Sender;
use std::thread;

use log::{debug, error, info, warn};

use crate::ambiance::Ambiance;
use crate::error::Result;
use crate::plan::{PlanNode, StepSpec};

/// Environment variable prefix for values exported to command steps.
const ENV_PREFIX: &str = "PLANFLOW";

/// Result of running a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded,
    Failed(String),
}

/// Completion message sent by step logic to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCompletion {
    pub node_execution_id: String,
    pub outcome: StepOutcome,
}

impl StepCompletion {
    pub fn succeeded(node_execution_id: impl Into<String>) -> Self {
        Self {
            node_execution_id: node_execution_id.into(),
            outcome: StepOutcome::Succeeded,
        }
    }

    pub fn failed(node_execution_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_execution_id: node_execution_id.into(),
            outcome: StepOutcome::Failed(message.into()),
        }
    }
}

/// Sending half of the engine's completion channel.
pub type CompletionSender = Sender<StepCompletion>;

/// A command node handed to a runner.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub node_execution_id: String,
    pub ambiance: Ambiance,
    pub node: PlanNode,
}

/// Executes command steps.
pub trait StepRunner: Send + Sync {
    /// Starts the step and returns without waiting for it.
    ///
    /// Exactly one [`StepCompletion`] must eventually be sent on
    /// `completions` unless this returns `Err`.
    fn run(&self, invocation: StepInvocation, completions: CompletionSender) -> Result<()>;
}

/// Runs each command in a bash script on its own worker thread.
#[derive(Debug, Clone, Default)]
pub struct CommandStepRunner {
    working_dir: Option<PathBuf>,
}

impl CommandStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the working directory for step execution.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl StepRunner for CommandStepRunner {
    fn run(&self, invocation: StepInvocation, completions: CompletionSender) -> Result<()> {
        let working_dir = self.working_dir.clone();

        thread::Builder::new()
            .name(format!("step-{}", invocation.node.identifier))
            .spawn(move || {
                let id = invocation.node_execution_id.clone();
                let completion = match execute_command(&invocation, working_dir.as_deref()) {
                    Ok(()) => StepCompletion::succeeded(&id),
                    Err(message) => StepCompletion::failed(&id, message),
                };

                if let Err(e) = completions.send(completion) {
                    error!("Failed to send completion for {}: {}", id, e);
                }
            })?;
        Ok(())
    }
}

/// Reports every command as succeeded without running it.
#[derive(Debug, Clone, Default)]
pub struct DryRunStepRunner;

impl StepRunner for DryRunStepRunner {
    fn run(&self, invocation: StepInvocation, completions: CompletionSender) -> Result<()> {
        println!();
        println!("[DRY RUN] Node: {}", invocation.node.identifier);
        if let StepSpec::Command { command } = &invocation.node.step {
            println!("  Command: {}", command);
        }
        println!("  Execution: {}", invocation.node_execution_id);

        if completions
            .send(StepCompletion::succeeded(&invocation.node_execution_id))
            .is_err()
        {
            warn!(
                "Engine stopped listening before dry run of {} completed",
                invocation.node_execution_id
            );
        }
        Ok(())
    }
}

/// Runs a command node to completion on the current thread.
fn execute_command(invocation: &StepInvocation, working_dir: Option<&Path>) -> std::result::Result<(), String> {
    let node = &invocation.node;
    let StepSpec::Command { command } = &node.step else {
        return Err(format!("Node '{}' is not a command step", node.identifier));
    };

    let script_path = create_execution_script(&invocation.node_execution_id, command)
        .map_err(|e| format!("Could not write script for '{}': {}", node.identifier, e))?;

    info!(
        "{} Running command for '{}'",
        invocation.ambiance.auto_log_context(),
        node.identifier
    );
    let output = execute_with_bash(&script_path, &invocation.ambiance, working_dir);

    if let Err(e) = fs::remove_file(&script_path) {
        warn!("Failed to clean up script {}: {}", script_path.display(), e);
    }

    let output = output.map_err(|e| format!("Could not start bash for '{}': {}", node.identifier, e))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("Node '{}' output:\n{}", node.identifier, stdout);
        }
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(
            "Node '{}' failed with exit code: {:?}",
            node.identifier,
            output.status.code()
        );
        if !stderr.trim().is_empty() {
            error!("stderr:\n{}", stderr);
        }
        Err(format!(
            "Command exited with code {}",
            output
                .status
                .code()
                .map_or_else(|| "none".to_string(), |code| code.to_string())
        ))
    }
}

/// Writes `command_text` to a temporary bash script.
fn create_execution_script(node_execution_id: &str, command_text: &str) -> std::io::Result<PathBuf> {
    let script_dir = std::env::temp_dir().join("planflow_scripts");
    fs::create_dir_all(&script_dir)?;

    let script_path = script_dir.join(format!("node_{}.sh", node_execution_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Environment exported to a command: plan execution id, node execution id
/// and every setup abstraction.
fn step_environment(ambiance: &Ambiance) -> Vec<(String, String)> {
    let mut vars = vec![(
        format!("{}_PLAN_EXECUTION_ID", ENV_PREFIX),
        ambiance.plan_execution_id().to_string(),
    )];
    if let Some(runtime_id) = ambiance.obtain_current_runtime_id() {
        vars.push((
            format!("{}_NODE_EXECUTION_ID", ENV_PREFIX),
            runtime_id.to_string(),
        ));
    }
    for (key, value) in ambiance.setup_abstractions() {
        vars.push((
            format!("{}_SETUP_{}", ENV_PREFIX, env_key(key)),
            value.clone(),
        ));
    }
    vars
}

/// Upper-cases a key and replaces anything outside `[A-Z0-9_]`.
fn env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn execute_with_bash(
    script_path: &Path,
    ambiance: &Ambiance,
    working_dir: Option<&Path>,
) -> std::io::Result<Output> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path).envs(step_environment(ambiance));

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    cmd.output()
}
