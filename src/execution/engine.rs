//! Orchestration Engine
//!
//! Sequences node executions through a plan:
//! - Instantiates plan nodes as node executions and starts them
//! - Hands command steps to a [`StepRunner`] and collects their completions
//! - Evaluates advisers when a node finishes and acts on the advise
//! - Fans out fork nodes through the [`ConcurrentChildScheduler`]
//! - Records every start and finish on an [`ExecutionTimeline`]
//!
//! Step runners report back over a channel that [`OrchestrationEngine::run_until_complete`]
//! drains on the calling thread, so all completion handling happens there.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use uuid::Uuid;

use super::concurrency::ConcurrentChildScheduler;
use super::node_execution::NodeExecution;
use super::status::ExecutionStatus;
use super::step::{CompletionSender, StepCompletion, StepInvocation, StepOutcome, StepRunner};
use crate::advise::{obtain_advise, AdviseDispatcher, AdvisingEvent};
use crate::ambiance::{Ambiance, Level};
use crate::config::EngineConfig;
use crate::error::{OrchestrationError, Result};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::plan::{Plan, PlanNode, StepSpec};
use crate::services::{EngineServices, NotifyResponse};

/// How often the run loop re-checks the plan status while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const ACTIVE_STATUSES: &[ExecutionStatus] = &[
    ExecutionStatus::Queued,
    ExecutionStatus::Running,
    ExecutionStatus::AsyncWaiting,
];

/// Engine operations used by advise dispatch and fan-out callbacks.
pub trait ExecutionEngine: Send + Sync {
    /// Instantiates `node` in the scope of `ambiance` and starts it.
    ///
    /// The new execution replaces the ambiance's current level (it runs after
    /// that node, as its sibling) or becomes the root level when the
    /// ambiance has none. Returns the new node execution id.
    fn trigger_execution(&self, ambiance: &Ambiance, node: &PlanNode) -> Result<String>;

    /// Starts the queued node execution named by the ambiance's current level.
    fn start_node_execution(&self, ambiance: &Ambiance) -> Result<()>;

    /// Replaces a finished node execution with a fresh attempt.
    fn retry_node(&self, node_execution_id: &str) -> Result<String>;

    /// Finishes the plan execution with `status`.
    fn end_plan(&self, plan_execution_id: &str, status: ExecutionStatus) -> Result<()>;

    /// Concludes a fork node once all of its children have reported.
    fn resume_parent(&self, parent_id: &str, responses: &HashMap<String, NotifyResponse>) -> Result<()>;
}

/// Plan orchestration engine.
///
/// # Example
///
/// ```rust,no_run
/// use planflow::config::EngineConfig;
/// use planflow::execution::{CommandStepRunner, OrchestrationEngine};
/// use planflow::services::EngineServices;
/// use planflow::load_plan;
/// use std::sync::Arc;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let plan = load_plan("plan.yaml")?;
///     let config = EngineConfig::default();
///     let engine = OrchestrationEngine::new(
///         EngineServices::in_memory(),
///         Arc::new(CommandStepRunner::new()),
///         config.clone(),
///     );
///
///     let id = engine.start_plan(plan, [("accountId", "acc-1")])?;
///     let status = engine.run_until_complete(&id, config.run_timeout())?;
///     println!("{}", status);
///     Ok(())
/// }
/// ```
pub struct OrchestrationEngine {
    services: EngineServices,
    step_runner: Arc<dyn StepRunner>,
    config: EngineConfig,
    completions_tx: Mutex<CompletionSender>,
    completions_rx: Mutex<Receiver<StepCompletion>>,
    timeline: Mutex<ExecutionTimeline>,
    me: Weak<OrchestrationEngine>,
}

impl OrchestrationEngine {
    pub fn new(services: EngineServices, step_runner: Arc<dyn StepRunner>, config: EngineConfig) -> Arc<Self> {
        let (tx, rx) = channel();
        Arc::new_cyclic(|me| Self {
            services,
            step_runner,
            config,
            completions_tx: Mutex::new(tx),
            completions_rx: Mutex::new(rx),
            timeline: Mutex::new(ExecutionTimeline::new()),
            me: me.clone(),
        })
    }

    pub fn services(&self) -> &EngineServices {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn handle(&self) -> Result<Arc<dyn ExecutionEngine>> {
        let me: Arc<dyn ExecutionEngine> = self
            .me
            .upgrade()
            .ok_or_else(|| OrchestrationError::StepDispatch("engine is shutting down".to_string()))?;
        Ok(me)
    }

    /// Registers `plan` as a new plan execution and triggers its start node.
    ///
    /// Returns the plan execution id.
    pub fn start_plan<K, V>(
        &self,
        plan: Plan,
        setup_abstractions: impl IntoIterator<Item = (K, V)>,
    ) -> Result<String>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let plan_name = plan.name.clone();
        let start_node_id = plan.start_node_id.clone();

        let plan_execution_id = self.services.plan_store.create(plan)?;
        let ambiance = Ambiance::new(&plan_execution_id, setup_abstractions)?;

        let Some(start_node) = self
            .services
            .plan_store
            .fetch_execution_node(&plan_execution_id, &start_node_id)?
        else {
            self.services
                .plan_store
                .update_status(&plan_execution_id, ExecutionStatus::Errored)?;
            return Err(OrchestrationError::node_not_found(
                plan_execution_id,
                start_node_id,
            ));
        };

        info!(
            "{} Starting plan '{}' at node '{}'",
            ambiance.auto_log_context(),
            plan_name,
            start_node.identifier
        );
        self.trigger_execution(&ambiance, &start_node)?;
        Ok(plan_execution_id)
    }

    pub fn plan_status(&self, plan_execution_id: &str) -> Result<ExecutionStatus> {
        self.services.plan_store.status(plan_execution_id)
    }

    /// Returns every node execution of a plan execution, oldest first.
    pub fn node_executions(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
        self.services
            .node_store
            .find_by_plan_execution(plan_execution_id)
    }

    /// Returns a snapshot of the execution timeline.
    pub fn timeline(&self) -> ExecutionTimeline {
        match self.timeline.lock() {
            Ok(timeline) => timeline.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns a sender step logic can report completions on.
    pub fn completion_sender(&self) -> Result<CompletionSender> {
        self.completions_tx
            .lock()
            .map(|tx| tx.clone())
            .map_err(|_| OrchestrationError::StepDispatch("completion channel poisoned".to_string()))
    }

    /// Applies a completion reported by step logic.
    ///
    /// Completions for node executions that already finished are ignored.
    pub fn handle_step_response(&self, completion: StepCompletion) -> Result<()> {
        let (status, failure) = match completion.outcome {
            StepOutcome::Succeeded => (ExecutionStatus::Succeeded, None),
            StepOutcome::Failed(message) => (ExecutionStatus::Failed, Some(message)),
        };
        self.conclude(&completion.node_execution_id, status, failure)
    }

    /// Drives the plan execution until it reaches a final status.
    ///
    /// Step completions are handled on the calling thread as they arrive.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the plan is still running after `timeout`.
    pub fn run_until_complete(&self, plan_execution_id: &str, timeout: Duration) -> Result<ExecutionStatus> {
        let deadline = Instant::now() + timeout;
        let receiver = self
            .completions_rx
            .lock()
            .map_err(|_| OrchestrationError::StepDispatch("completion channel poisoned".to_string()))?;

        loop {
            let status = self.plan_status(plan_execution_id)?;
            if status.is_final() {
                info!(
                    "Plan execution {} finished with {} in {:.2?}",
                    plan_execution_id,
                    status,
                    self.timeline().elapsed()
                );
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestrationError::Timeout(plan_execution_id.to_string()));
            }

            match receiver.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
                Ok(completion) => {
                    let node_execution_id = completion.node_execution_id.clone();
                    if let Err(e) = self.handle_step_response(completion) {
                        error!("Failed to handle completion of {}: {}", node_execution_id, e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(OrchestrationError::StepDispatch(
                        "completion channel closed".to_string(),
                    ));
                }
            }
        }
    }

    fn report(&self, completion: StepCompletion) -> Result<()> {
        self.completion_sender()?
            .send(completion)
            .map_err(|e| OrchestrationError::StepDispatch(e.to_string()))
    }

    fn record(&self, node_execution: &NodeExecution, event_type: EventType) {
        if let Ok(mut timeline) = self.timeline.lock() {
            timeline.add_event(
                node_execution.uuid.clone(),
                node_execution.identifier(),
                event_type,
            );
        }
    }

    /// Moves an active node execution to a final status and acts on its advise.
    fn conclude(&self, node_execution_id: &str, status: ExecutionStatus, failure: Option<String>) -> Result<()> {
        let store = &self.services.node_store;

        let Some(mut node_execution) = store.transition_if(node_execution_id, ACTIVE_STATUSES, status)? else {
            warn!(
                "Node execution {} already finished; ignoring {} outcome",
                node_execution_id, status
            );
            return Ok(());
        };

        if let Some(message) = failure {
            node_execution = store.update(node_execution_id, &mut |ne| {
                ne.failure_message = Some(message.clone())
            })?;
        }
        self.record(&node_execution, EventType::Finished(status));

        let ambiance = node_execution.ambiance.clone();
        match &node_execution.failure_message {
            Some(message) => warn!(
                "{} Node '{}' finished {}: {}",
                ambiance.auto_log_context(),
                node_execution.identifier(),
                status,
                message
            ),
            None => info!(
                "{} Node '{}' finished {}",
                ambiance.auto_log_context(),
                node_execution.identifier(),
                status
            ),
        }

        let node = node_execution.node.clone().ok_or_else(|| {
            OrchestrationError::store(format!("node execution {} has no plan node", node_execution_id))
        })?;

        let event = AdvisingEvent {
            ambiance: ambiance.clone(),
            node_execution_id: node_execution.uuid.clone(),
            status,
            retry_count: node_execution.retry_ids.len(),
            failure_message: node_execution.failure_message.clone(),
        };

        let Some(advise) = obtain_advise(&node, &event) else {
            return self.finish_path(&node_execution);
        };

        let dispatcher = AdviseDispatcher::new(self, self.services.plan_store.as_ref());
        if let Err(e) = dispatcher.handle(&ambiance, advise) {
            error!(
                "{} Could not act on advise for '{}': {}",
                ambiance.auto_log_context(),
                node.identifier,
                e
            );
            let message = e.to_string();
            let errored = store.update(node_execution_id, &mut |ne| {
                ne.status = ExecutionStatus::Errored;
                ne.failure_message = Some(message.clone());
            })?;
            self.finish_path(&errored)?;
            return Err(e);
        }
        Ok(())
    }

    /// Ends an execution path that has no further advise.
    ///
    /// Nodes running under a fan-out report to their parent; anything else
    /// ends the plan.
    fn finish_path(&self, node_execution: &NodeExecution) -> Result<()> {
        match &node_execution.notify_id {
            Some(notify_id) => {
                debug!(
                    "{} Reporting {} under {}",
                    node_execution.ambiance.auto_log_context(),
                    node_execution.status,
                    notify_id
                );
                let response = NotifyResponse {
                    node_execution_id: node_execution.uuid.clone(),
                    status: node_execution.status,
                    error_message: node_execution.failure_message.clone(),
                };
                self.services.wait_notify.done_with(notify_id, response)
            }
            None => self.end_plan(node_execution.ambiance.plan_execution_id(), node_execution.status),
        }
    }

    fn start_fork(&self, node_execution: &NodeExecution, children: &[String], max_concurrency: usize) -> Result<()> {
        let plan_execution_id = node_execution.ambiance.plan_execution_id();

        let mut child_nodes = Vec::with_capacity(children.len());
        for child_id in children {
            match self
                .services
                .plan_store
                .fetch_execution_node(plan_execution_id, child_id)?
            {
                Some(node) => child_nodes.push(node),
                None => {
                    let error = OrchestrationError::node_not_found(plan_execution_id, child_id);
                    error!("{} {}", node_execution.ambiance.auto_log_context(), error);
                    return self.report(StepCompletion::failed(&node_execution.uuid, error.to_string()));
                }
            }
        }

        if child_nodes.is_empty() {
            debug!(
                "{} Fork '{}' has no children",
                node_execution.ambiance.auto_log_context(),
                node_execution.identifier()
            );
            return self.report(StepCompletion::succeeded(&node_execution.uuid));
        }

        let limit = if max_concurrency == 0 {
            self.config.default_max_concurrency
        } else {
            max_concurrency
        };

        self.services.node_store.transition_if(
            &node_execution.uuid,
            &[ExecutionStatus::Running],
            ExecutionStatus::AsyncWaiting,
        )?;

        let scheduler = ConcurrentChildScheduler::new(self.handle()?, self.services.clone(), &self.config);
        if let Err(e) = scheduler.start(node_execution, &child_nodes, limit) {
            let reason = format!("fan-out failed to start: {}", e);
            scheduler.abort(&node_execution.uuid, &reason);
            return self.conclude(&node_execution.uuid, ExecutionStatus::Errored, Some(reason));
        }
        Ok(())
    }

    /// Drops the wait/notify responses of a finished plan's node executions.
    fn forget_completions(&self, plan_execution_id: &str) -> Result<usize> {
        let correlation_ids: Vec<String> = self
            .services
            .node_store
            .find_by_plan_execution(plan_execution_id)?
            .into_iter()
            .filter_map(|ne| ne.notify_id)
            .collect();
        self.services.wait_notify.forget(&correlation_ids)
    }
}

impl ExecutionEngine for OrchestrationEngine {
    fn trigger_execution(&self, ambiance: &Ambiance, node: &PlanNode) -> Result<String> {
        let store = &self.services.node_store;
        let uuid = Uuid::new_v4().to_string();

        let previous = match ambiance.obtain_current_runtime_id() {
            Some(previous_id) => Some(store.update(previous_id, &mut |ne| {
                ne.next_id = Some(uuid.clone())
            })?),
            None => None,
        };

        let scope = match previous {
            Some(_) => ambiance.clone_for_finish(),
            None => ambiance.clone_for_child(),
        };
        let node_ambiance = scope.with_level(Level::new(&node.identifier, &uuid, &node.uuid))?;

        let node_execution = NodeExecution::queued(&uuid, node_ambiance.clone(), node.clone())
            .with_parent(previous.as_ref().and_then(|p| p.parent_id.clone()))
            .with_notify_id(previous.as_ref().and_then(|p| p.notify_id.clone()))
            .with_previous(previous.as_ref().map(|p| p.uuid.clone()));
        store.save(node_execution)?;

        debug!(
            "{} Queued node '{}'",
            node_ambiance.auto_log_context(),
            node.identifier
        );
        self.start_node_execution(&node_ambiance)?;
        Ok(uuid)
    }

    fn start_node_execution(&self, ambiance: &Ambiance) -> Result<()> {
        let node_execution_id = ambiance.obtain_current_runtime_id().ok_or_else(|| {
            OrchestrationError::InvalidAmbiance("no level to start".to_string())
        })?;

        let Some(node_execution) = self.services.node_store.transition_if(
            node_execution_id,
            &[ExecutionStatus::Queued],
            ExecutionStatus::Running,
        )?
        else {
            warn!(
                "{} Node execution {} is not queued; not starting it",
                ambiance.auto_log_context(),
                node_execution_id
            );
            return Ok(());
        };
        self.record(&node_execution, EventType::Started);

        let node = node_execution.node.clone().ok_or_else(|| {
            OrchestrationError::store(format!("node execution {} has no plan node", node_execution_id))
        })?;
        info!(
            "{} Starting node '{}'",
            node_execution.ambiance.auto_log_context(),
            node.identifier
        );

        match &node.step {
            StepSpec::Noop => self.report(StepCompletion::succeeded(node_execution_id)),
            StepSpec::Command { .. } => {
                let invocation = StepInvocation {
                    node_execution_id: node_execution.uuid.clone(),
                    ambiance: node_execution.ambiance.clone(),
                    node: node.clone(),
                };
                if let Err(e) = self.step_runner.run(invocation, self.completion_sender()?) {
                    error!(
                        "{} Could not dispatch '{}': {}",
                        node_execution.ambiance.auto_log_context(),
                        node.identifier,
                        e
                    );
                    self.report(StepCompletion::failed(node_execution_id, e.to_string()))?;
                }
                Ok(())
            }
            StepSpec::Fork {
                children,
                max_concurrency,
            } => self.start_fork(&node_execution, children, *max_concurrency),
        }
    }

    fn retry_node(&self, node_execution_id: &str) -> Result<String> {
        let store = &self.services.node_store;
        let failed = store.get(node_execution_id)?;
        let node = failed.node.clone().ok_or_else(|| {
            OrchestrationError::store(format!("node execution {} has no plan node", node_execution_id))
        })?;

        let uuid = Uuid::new_v4().to_string();
        let ambiance = failed
            .ambiance
            .clone_for_finish()
            .with_level(Level::new(&node.identifier, &uuid, &node.uuid))?;

        let mut retry = NodeExecution::queued(&uuid, ambiance.clone(), node)
            .with_parent(failed.parent_id.clone())
            .with_notify_id(failed.notify_id.clone())
            .with_previous(failed.previous_id.clone());
        retry.retry_ids = failed.retry_ids.clone();
        retry.retry_ids.push(failed.uuid.clone());
        store.save(retry)?;

        if let Some(previous_id) = &failed.previous_id {
            store.update(previous_id, &mut |ne| ne.next_id = Some(uuid.clone()))?;
        }

        info!(
            "{} Retry {} of '{}'",
            ambiance.auto_log_context(),
            failed.retry_ids.len() + 1,
            failed.identifier()
        );
        self.start_node_execution(&ambiance)?;
        Ok(uuid)
    }

    fn end_plan(&self, plan_execution_id: &str, status: ExecutionStatus) -> Result<()> {
        let current = self.plan_status(plan_execution_id)?;
        if current.is_final() {
            warn!(
                "Plan execution {} already finished with {}; ignoring {}",
                plan_execution_id, current, status
            );
            return Ok(());
        }

        self.services
            .plan_store
            .update_status(plan_execution_id, status)?;
        info!("Plan execution {} ended: {}", plan_execution_id, status);

        if let Err(e) = self.forget_completions(plan_execution_id) {
            warn!(
                "Could not drop completion records of plan execution {}: {}",
                plan_execution_id, e
            );
        }
        Ok(())
    }

    fn resume_parent(&self, parent_id: &str, responses: &HashMap<String, NotifyResponse>) -> Result<()> {
        let status = ExecutionStatus::aggregate(responses.values().map(|r| r.status));
        let failure = if status == ExecutionStatus::Succeeded {
            None
        } else {
            let broken = responses
                .values()
                .filter(|r| r.status != ExecutionStatus::Succeeded)
                .count();
            Some(format!("{} of {} children did not succeed", broken, responses.len()))
        };

        debug!("Resuming parent {} with {}", parent_id, status);
        self.conclude(parent_id, status, failure)
    }
}
