//! Concurrency-Limited Fan-Out
//!
//! A fork node starts its children through a [`ConcurrentChildScheduler`]:
//! only the first `max_concurrency` children start right away, and each
//! child that finishes admits the next one through a
//! [`MaxConcurrentChildCallback`]. The admission cursor lives in the
//! child-instance store and is advanced under a per-parent lock, so a child
//! is admitted at most once even when several finish at the same moment.
//!
//! If the admission state cannot be read or advanced, the fan-out is
//! aborted: every still-active child is errored out and reported, so the
//! parent's resume callback fires and the parent does not hang. Completions
//! that arrive after the parent finished, or after its fan-out was torn
//! down, admit nothing.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::ExecutionEngine;
use super::node_execution::{NodeExecution, NodeProjection};
use crate::ambiance::Level;
use crate::config::EngineConfig;
use crate::error::{OrchestrationError, Result};
use crate::plan::PlanNode;
use crate::services::{ConcurrentChildInstance, EngineServices, NotifyCallback, NotifyResponse};

/// Prefix of the per-parent admission lock key.
pub const MAX_CONCURRENT_CHILD_LOCK: &str = "MAX_CONCURRENT_CHILD_LOCK";

/// Lock key guarding the admission cursor of `parent_id`.
pub fn lock_key(parent_id: &str) -> String {
    format!("{}/{}", MAX_CONCURRENT_CHILD_LOCK, parent_id)
}

/// Result of advancing a parent's admission cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorAdvance {
    /// This caller claimed the child at `index`
    Next { index: usize, child_id: String },
    /// Every child has already been admitted
    Exhausted,
    /// No admission state exists for the parent
    Missing,
}

impl CursorAdvance {
    /// Interprets the record returned by `increment_cursor`.
    fn from_claim(claim: Option<ConcurrentChildInstance>) -> Self {
        match claim {
            None => Self::Missing,
            Some(before) => match before.next_pending() {
                Some(child_id) => Self::Next {
                    index: before.cursor,
                    child_id: child_id.to_string(),
                },
                None => Self::Exhausted,
            },
        }
    }
}

/// What one completion callback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { child_id: String },
    Exhausted,
    /// The fan-out is already over; nothing to admit
    Settled,
    Aborted { reason: String },
}

/// Starts and throttles the children of fork nodes.
#[derive(Clone)]
pub struct ConcurrentChildScheduler {
    engine: Arc<dyn ExecutionEngine>,
    services: EngineServices,
    publisher_name: String,
    lock_wait: Duration,
    lock_ttl: Duration,
}

impl ConcurrentChildScheduler {
    pub fn new(engine: Arc<dyn ExecutionEngine>, services: EngineServices, config: &EngineConfig) -> Self {
        Self {
            engine,
            services,
            publisher_name: config.publisher_name.clone(),
            lock_wait: config.lock_wait(),
            lock_ttl: config.lock_ttl(),
        }
    }

    /// Initializes the fan-out of `parent` over `child_nodes`.
    ///
    /// Materializes one queued execution per child, records the admission
    /// state, registers the parent's resume callback on every child and
    /// starts the first `max_concurrency` of them. Returns the number of
    /// children; with zero children nothing is recorded.
    pub fn start(&self, parent: &NodeExecution, child_nodes: &[PlanNode], max_concurrency: usize) -> Result<usize> {
        let children = self.materialize(parent, child_nodes)?;
        if children.is_empty() {
            return Ok(0);
        }

        let child_ids: Vec<String> = children.iter().map(|child| child.uuid.clone()).collect();
        let max_concurrency = max_concurrency.max(1);
        let initial = max_concurrency.min(children.len());

        self.services.child_instances.save(
            &parent.uuid,
            ConcurrentChildInstance::new(initial, child_ids.clone()),
        )?;

        self.services.wait_notify.wait_for_all_on(
            &self.publisher_name,
            Arc::new(ResumeParentCallback::new(
                Arc::clone(&self.engine),
                parent.uuid.clone(),
            )),
            &child_ids,
        )?;

        info!(
            "{} Fanning out {} children, {} at a time",
            parent.ambiance.auto_log_context(),
            children.len(),
            max_concurrency
        );

        let callback = MaxConcurrentChildCallback::new(self.clone(), parent.uuid.clone(), max_concurrency);
        for child in &children[..initial] {
            self.engine.start_node_execution(&child.ambiance)?;
            self.services.wait_notify.wait_for_all_on(
                &self.publisher_name,
                callback.clone(),
                std::slice::from_ref(&child.uuid),
            )?;
        }

        Ok(children.len())
    }

    fn materialize(&self, parent: &NodeExecution, child_nodes: &[PlanNode]) -> Result<Vec<NodeExecution>> {
        let mut children = Vec::with_capacity(child_nodes.len());
        for node in child_nodes {
            let uuid = Uuid::new_v4().to_string();
            let ambiance = parent
                .ambiance
                .with_level(Level::new(&node.identifier, &uuid, &node.uuid))?;

            let child = NodeExecution::queued(&uuid, ambiance, node.clone())
                .with_parent(Some(parent.uuid.clone()))
                .with_notify_id(Some(uuid.clone()));
            self.services.node_store.save(child.clone())?;
            children.push(child);
        }
        Ok(children)
    }

    /// Tears down the fan-out of `parent_id`.
    ///
    /// Discards the admission state, errors out every active descendant and
    /// reports each of them under its notify id. Nested forks among the
    /// errored descendants lose their admission state too.
    pub fn abort(&self, parent_id: &str, reason: &str) {
        error!("Aborting fan-out of {}: {}", parent_id, reason);

        if let Err(e) = self.services.child_instances.remove(parent_id) {
            warn!("Could not discard fan-out state of {}: {}", parent_id, e);
        }

        let errored = match self.services.node_store.error_out_active_nodes(parent_id) {
            Ok(errored) => errored,
            Err(e) => {
                error!("Could not error out children of {}: {}", parent_id, e);
                return;
            }
        };

        for child in &errored {
            match self.services.child_instances.remove(&child.uuid) {
                Ok(Some(_)) => debug!("Discarded fan-out state of nested fork {}", child.uuid),
                Ok(None) => {}
                Err(e) => warn!("Could not discard fan-out state of {}: {}", child.uuid, e),
            }
        }

        for child in errored {
            let Some(notify_id) = child.notify_id.as_deref() else {
                continue;
            };
            let response = NotifyResponse::errored(&child.uuid, reason);
            if let Err(e) = self.services.wait_notify.done_with(notify_id, response) {
                warn!("Could not report errored child {}: {}", child.uuid, e);
            }
        }
    }
}

/// Admits the next child of a fan-out each time one of its children finishes.
///
/// A single instance serves the whole fan-out; it re-registers itself on
/// every child it admits.
pub struct MaxConcurrentChildCallback {
    scheduler: ConcurrentChildScheduler,
    parent_node_execution_id: String,
    max_concurrency: usize,
    me: Weak<MaxConcurrentChildCallback>,
}

impl MaxConcurrentChildCallback {
    pub fn new(
        scheduler: ConcurrentChildScheduler,
        parent_node_execution_id: impl Into<String>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        let parent_node_execution_id = parent_node_execution_id.into();
        Arc::new_cyclic(|me| Self {
            scheduler,
            parent_node_execution_id,
            max_concurrency,
            me: me.clone(),
        })
    }

    pub fn parent_node_execution_id(&self) -> &str {
        &self.parent_node_execution_id
    }

    /// Claims and starts the next pending child, if any.
    pub fn admit_next(&self) -> Admission {
        match self.parent_finished() {
            Ok(true) => {
                debug!(
                    "Parent {} already finished; admitting nothing",
                    self.parent_node_execution_id
                );
                self.discard_state();
                return Admission::Settled;
            }
            Ok(false) => {}
            Err(e) => return self.abort(e.to_string()),
        }

        let advance = match self.advance_cursor() {
            Ok(advance) => advance,
            Err(e) => return self.abort(e.to_string()),
        };

        match advance {
            CursorAdvance::Next { index, child_id } => match self.admit(&child_id) {
                Ok(()) => {
                    debug!(
                        "Admitted child {} ({}) of {} (limit {})",
                        index, child_id, self.parent_node_execution_id, self.max_concurrency
                    );
                    Admission::Admitted { child_id }
                }
                Err(e) => self.abort(format!("could not start child {}: {}", child_id, e)),
            },
            CursorAdvance::Exhausted => {
                debug!(
                    "All children of {} already admitted",
                    self.parent_node_execution_id
                );
                self.discard_if_settled();
                Admission::Exhausted
            }
            // A torn-down fan-out leaves every child final; only a lost
            // record with children still active needs an abort.
            CursorAdvance::Missing if self.children_settled() => {
                debug!(
                    "Fan-out of {} already torn down",
                    self.parent_node_execution_id
                );
                Admission::Settled
            }
            CursorAdvance::Missing => self.abort(format!(
                "no fan-out state for parent {}",
                self.parent_node_execution_id
            )),
        }
    }

    fn parent_finished(&self) -> Result<bool> {
        let parent = self
            .scheduler
            .services
            .node_store
            .get_with_fields_included(&self.parent_node_execution_id, NodeProjection::AmbianceAndStatus)?;
        Ok(parent.status.is_final())
    }

    /// True when the parent has children and all of them are final.
    fn children_settled(&self) -> bool {
        match self
            .scheduler
            .services
            .node_store
            .find_children(&self.parent_node_execution_id)
        {
            Ok(children) => !children.is_empty() && children.iter().all(|child| child.status.is_final()),
            Err(e) => {
                warn!(
                    "Could not read children of {}: {}",
                    self.parent_node_execution_id, e
                );
                false
            }
        }
    }

    /// Advances the cursor while holding the parent's lock.
    fn advance_cursor(&self) -> Result<CursorAdvance> {
        let scheduler = &self.scheduler;
        let key = lock_key(&self.parent_node_execution_id);

        let Some(lock) = scheduler
            .services
            .locker
            .wait_to_acquire_lock(&key, scheduler.lock_wait, scheduler.lock_ttl)?
        else {
            return Err(OrchestrationError::Lock(format!(
                "could not acquire {} within {:?}",
                key, scheduler.lock_wait
            )));
        };

        let claim = scheduler
            .services
            .child_instances
            .increment_cursor(&self.parent_node_execution_id);
        lock.release();

        Ok(CursorAdvance::from_claim(claim?))
    }

    fn admit(&self, child_id: &str) -> Result<()> {
        let scheduler = &self.scheduler;
        let child = scheduler
            .services
            .node_store
            .get_with_fields_included(child_id, NodeProjection::AmbianceAndStatus)?;

        scheduler.engine.start_node_execution(&child.ambiance)?;

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| OrchestrationError::StepDispatch("fan-out callback dropped".to_string()))?;
        scheduler.services.wait_notify.wait_for_all_on(
            &scheduler.publisher_name,
            me,
            &[child_id.to_string()],
        )?;
        Ok(())
    }

    /// Drops the admission state once every child has finished.
    fn discard_if_settled(&self) {
        if self.children_settled() {
            self.discard_state();
        }
    }

    fn discard_state(&self) {
        if let Err(e) = self
            .scheduler
            .services
            .child_instances
            .remove(&self.parent_node_execution_id)
        {
            warn!(
                "Could not discard fan-out state of {}: {}",
                self.parent_node_execution_id, e
            );
        }
    }

    fn abort(&self, reason: String) -> Admission {
        self.scheduler.abort(&self.parent_node_execution_id, &reason);
        Admission::Aborted { reason }
    }
}

impl NotifyCallback for MaxConcurrentChildCallback {
    fn notify(&self, responses: &HashMap<String, NotifyResponse>) {
        debug!(
            "Children {:?} of {} finished",
            responses.keys().collect::<Vec<_>>(),
            self.parent_node_execution_id
        );
        self.admit_next();
    }
}

/// Resumes a fork node once all of its children have reported.
pub struct ResumeParentCallback {
    engine: Arc<dyn ExecutionEngine>,
    parent_node_execution_id: String,
}

impl ResumeParentCallback {
    pub fn new(engine: Arc<dyn ExecutionEngine>, parent_node_execution_id: String) -> Self {
        Self {
            engine,
            parent_node_execution_id,
        }
    }
}

impl NotifyCallback for ResumeParentCallback {
    fn notify(&self, responses: &HashMap<String, NotifyResponse>) {
        if let Err(e) = self
            .engine
            .resume_parent(&self.parent_node_execution_id, responses)
        {
            error!(
                "Failed to resume parent {}: {}",
                self.parent_node_execution_id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    use crate::ambiance::Ambiance;
    use crate::execution::status::ExecutionStatus;
    use crate::services::{
        AcquiredLock, InMemoryLocker, InMemoryNodeStore, InMemoryWaitNotify, NodeExecutionService,
        PersistentLocker, WaitNotifyEngine,
    };

    const PUBLISHER: &str = "test-publisher";

    #[derive(Default)]
    struct RecordingEngine {
        started: Mutex<Vec<String>>,
        resumed: Mutex<Vec<(String, usize)>>,
    }

    impl RecordingEngine {
        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    impl ExecutionEngine for RecordingEngine {
        fn trigger_execution(&self, _ambiance: &Ambiance, _node: &PlanNode) -> Result<String> {
            unreachable!("fan-out never triggers");
        }

        fn start_node_execution(&self, ambiance: &Ambiance) -> Result<()> {
            let id = ambiance.obtain_current_runtime_id().unwrap().to_string();
            self.started.lock().unwrap().push(id);
            Ok(())
        }

        fn retry_node(&self, _node_execution_id: &str) -> Result<String> {
            unreachable!("fan-out never retries");
        }

        fn end_plan(&self, _plan_execution_id: &str, _status: ExecutionStatus) -> Result<()> {
            Ok(())
        }

        fn resume_parent(&self, parent_id: &str, responses: &HashMap<String, NotifyResponse>) -> Result<()> {
            self.resumed
                .lock()
                .unwrap()
                .push((parent_id.to_string(), responses.len()));
            Ok(())
        }
    }

    /// Node store that counts error-out requests.
    #[derive(Default)]
    struct CountingNodeStore {
        inner: InMemoryNodeStore,
        error_outs: Mutex<usize>,
    }

    impl NodeExecutionService for CountingNodeStore {
        fn save(&self, node_execution: NodeExecution) -> Result<()> {
            self.inner.save(node_execution)
        }

        fn get(&self, id: &str) -> Result<NodeExecution> {
            self.inner.get(id)
        }

        fn get_with_fields_included(&self, id: &str, projection: NodeProjection) -> Result<NodeExecution> {
            self.inner.get_with_fields_included(id, projection)
        }

        fn update(&self, id: &str, ops: &mut dyn FnMut(&mut NodeExecution)) -> Result<NodeExecution> {
            self.inner.update(id, ops)
        }

        fn transition_if(
            &self,
            id: &str,
            from: &[ExecutionStatus],
            to: ExecutionStatus,
        ) -> Result<Option<NodeExecution>> {
            self.inner.transition_if(id, from, to)
        }

        fn error_out_active_nodes(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
            *self.error_outs.lock().unwrap() += 1;
            self.inner.error_out_active_nodes(parent_id)
        }

        fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>> {
            self.inner.find_children(parent_id)
        }

        fn find_by_plan_execution(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>> {
            self.inner.find_by_plan_execution(plan_execution_id)
        }
    }

    struct BusyLocker;

    impl PersistentLocker for BusyLocker {
        fn wait_to_acquire_lock(&self, _key: &str, _wait: Duration, _ttl: Duration) -> Result<Option<AcquiredLock>> {
            Ok(None)
        }
    }

    struct BrokenLocker;

    impl PersistentLocker for BrokenLocker {
        fn wait_to_acquire_lock(&self, _key: &str, _wait: Duration, _ttl: Duration) -> Result<Option<AcquiredLock>> {
            Err(OrchestrationError::Lock("backend unavailable".to_string()))
        }
    }

    struct Fixture {
        engine: Arc<RecordingEngine>,
        node_store: Arc<CountingNodeStore>,
        wait_notify: Arc<InMemoryWaitNotify>,
        locker: Arc<InMemoryLocker>,
        services: EngineServices,
        config: EngineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let node_store = Arc::new(CountingNodeStore::default());
            let wait_notify = Arc::new(InMemoryWaitNotify::new());
            let locker = Arc::new(InMemoryLocker::new());
            let mut services = EngineServices::in_memory();
            services.node_store = node_store.clone();
            services.wait_notify = wait_notify.clone();
            services.locker = locker.clone();

            let config = EngineConfig {
                lock_wait_ms: 200,
                publisher_name: PUBLISHER.to_string(),
                ..EngineConfig::default()
            };

            Self {
                engine: Arc::new(RecordingEngine::default()),
                node_store,
                wait_notify,
                locker,
                services,
                config,
            }
        }

        fn scheduler(&self) -> ConcurrentChildScheduler {
            ConcurrentChildScheduler::new(self.engine.clone(), self.services.clone(), &self.config)
        }

        fn parent(&self) -> NodeExecution {
            let ambiance = Ambiance::new("plan1", [("accountId", "acc")])
                .unwrap()
                .with_level(Level::new("fork", "p", "fork"))
                .unwrap();
            let mut parent = NodeExecution::queued("p", ambiance, PlanNode::noop("fork", "fork"));
            parent.status = ExecutionStatus::AsyncWaiting;
            self.node_store.save(parent.clone()).unwrap();
            parent
        }

        /// Saves queued children `ids` under parent "p" and records a cursor.
        fn children(&self, ids: &[&str], cursor: usize) {
            let parent = self.parent();
            for id in ids {
                let ambiance = parent.ambiance.with_level(Level::new(*id, *id, *id)).unwrap();
                let child = NodeExecution::queued(*id, ambiance, PlanNode::noop(*id, *id))
                    .with_parent(Some("p".to_string()))
                    .with_notify_id(Some(id.to_string()));
                self.node_store.save(child).unwrap();
            }
            self.services
                .child_instances
                .save(
                    "p",
                    ConcurrentChildInstance::new(cursor, ids.iter().map(|s| s.to_string()).collect()),
                )
                .unwrap();
        }

        /// Saves a record under `parent_id` with the given status.
        fn child(&self, id: &str, parent_id: &str, status: ExecutionStatus) {
            let ambiance = Ambiance::new("plan1", [("accountId", "acc")])
                .unwrap()
                .with_level(Level::new(id, id, id))
                .unwrap();
            let mut child = NodeExecution::queued(id, ambiance, PlanNode::noop(id, id))
                .with_parent(Some(parent_id.to_string()))
                .with_notify_id(Some(id.to_string()));
            child.status = status;
            self.node_store.save(child).unwrap();
        }

        fn error_outs(&self) -> usize {
            *self.node_store.error_outs.lock().unwrap()
        }
    }

    fn nodes(ids: &[&str]) -> Vec<PlanNode> {
        ids.iter().map(|id| PlanNode::noop(*id, *id)).collect()
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key("abc"), "MAX_CONCURRENT_CHILD_LOCK/abc");
    }

    #[test]
    fn test_cursor_advance_from_claim() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(CursorAdvance::from_claim(None), CursorAdvance::Missing);
        assert_eq!(
            CursorAdvance::from_claim(Some(ConcurrentChildInstance::new(1, ids.clone()))),
            CursorAdvance::Next {
                index: 1,
                child_id: "b".to_string()
            }
        );
        assert_eq!(
            CursorAdvance::from_claim(Some(ConcurrentChildInstance::new(2, ids))),
            CursorAdvance::Exhausted
        );
    }

    #[test]
    fn test_completion_admits_next_child() {
        let fx = Fixture::new();
        fx.children(&["a", "b", "c"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        let admission = callback.admit_next();

        assert_eq!(
            admission,
            Admission::Admitted {
                child_id: "c".to_string()
            }
        );
        assert_eq!(fx.engine.started(), vec!["c"]);
        assert_eq!(fx.wait_notify.pending_waits(PUBLISHER), 1);
        assert_eq!(
            fx.services.child_instances.get("p").unwrap().unwrap().cursor,
            3
        );
        assert!(!fx.locker.is_locked(&lock_key("p")));
    }

    #[test]
    fn test_admitted_child_reregisters_same_callback() {
        let fx = Fixture::new();
        fx.children(&["a", "b", "c"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);
        callback.admit_next();

        // "c" finishing fires the callback again, which finds nothing left.
        fx.wait_notify
            .done_with("c", NotifyResponse::new("c", ExecutionStatus::Succeeded))
            .unwrap();

        assert_eq!(fx.engine.started(), vec!["c"]);
        assert_eq!(fx.wait_notify.pending_waits(PUBLISHER), 0);
        assert_eq!(
            fx.services.child_instances.get("p").unwrap().unwrap().cursor,
            3
        );
        assert_eq!(fx.error_outs(), 0);
    }

    #[test]
    fn test_exhausted_is_not_an_error() {
        let fx = Fixture::new();
        fx.children(&["a", "b"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        assert_eq!(callback.admit_next(), Admission::Exhausted);
        assert!(fx.engine.started().is_empty());
        assert_eq!(fx.error_outs(), 0);
        // Children are still queued, so the state is kept.
        assert!(fx.services.child_instances.get("p").unwrap().is_some());
    }

    #[test]
    fn test_exhausted_discards_state_once_children_settle() {
        let fx = Fixture::new();
        fx.children(&["a", "b"], 2);
        for id in ["a", "b"] {
            fx.node_store
                .update_status(id, ExecutionStatus::Succeeded)
                .unwrap();
        }
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        assert_eq!(callback.admit_next(), Admission::Exhausted);
        assert!(fx.services.child_instances.get("p").unwrap().is_none());
    }

    #[test]
    fn test_missing_state_aborts_fan_out() {
        let fx = Fixture::new();
        fx.parent();
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        let admission = callback.admit_next();

        assert!(matches!(admission, Admission::Aborted { .. }));
        assert_eq!(fx.error_outs(), 1);
        assert!(fx.engine.started().is_empty());
        assert!(!fx.locker.is_locked(&lock_key("p")));
    }

    #[test]
    fn test_abort_runs_once_when_started_children_report() {
        let fx = Fixture::new();
        let parent = fx.parent();
        fx.scheduler()
            .start(&parent, &nodes(&["a", "b", "c"]), 2)
            .unwrap();
        fx.services.child_instances.remove("p").unwrap();

        let first = fx.engine.started()[0].clone();
        fx.node_store
            .update_status(&first, ExecutionStatus::Succeeded)
            .unwrap();
        fx.wait_notify
            .done_with(&first, NotifyResponse::new(&first, ExecutionStatus::Succeeded))
            .unwrap();

        // The second started child reports through its own callback, which
        // must not abort again.
        assert_eq!(fx.error_outs(), 1);
        assert_eq!(fx.engine.started().len(), 2);
        let children = fx.node_store.find_children("p").unwrap();
        assert!(children.iter().all(|child| child.status.is_final()));
        assert_eq!(
            fx.engine.resumed.lock().unwrap().clone(),
            vec![("p".to_string(), 3)]
        );
    }

    #[test]
    fn test_outer_abort_tears_down_nested_fork() {
        let fx = Fixture::new();
        fx.parent();
        fx.child("f", "p", ExecutionStatus::AsyncWaiting);
        fx.child("x", "p", ExecutionStatus::Running);
        fx.child("g1", "f", ExecutionStatus::Running);
        fx.child("g2", "f", ExecutionStatus::Running);
        fx.child("g3", "f", ExecutionStatus::Queued);
        fx.services
            .child_instances
            .save("f", ConcurrentChildInstance::new(2, vec!["g1".into(), "g2".into(), "g3".into()]))
            .unwrap();

        let scheduler = fx.scheduler();
        let inner = MaxConcurrentChildCallback::new(scheduler.clone(), "f", 2);
        for id in ["g1", "g2"] {
            fx.wait_notify
                .wait_for_all_on(PUBLISHER, inner.clone(), &[id.to_string()])
                .unwrap();
        }

        scheduler.abort("p", "outer fan-out lost");

        assert_eq!(fx.error_outs(), 1);
        assert!(fx.engine.started().is_empty());
        assert!(fx.services.child_instances.get("f").unwrap().is_none());
        for id in ["f", "x", "g1", "g2", "g3"] {
            assert_eq!(fx.node_store.get(id).unwrap().status, ExecutionStatus::Errored);
        }
        assert_eq!(fx.wait_notify.pending_waits(PUBLISHER), 0);
    }

    #[test]
    fn test_finished_parent_admits_nothing() {
        let fx = Fixture::new();
        fx.children(&["a", "b", "c"], 2);
        fx.node_store
            .update_status("p", ExecutionStatus::Errored)
            .unwrap();
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        assert_eq!(callback.admit_next(), Admission::Settled);
        assert!(fx.engine.started().is_empty());
        assert_eq!(fx.error_outs(), 0);
        assert!(fx.services.child_instances.get("p").unwrap().is_none());
    }

    #[test]
    fn test_busy_lock_aborts_fan_out() {
        let mut fx = Fixture::new();
        fx.services.locker = Arc::new(BusyLocker);
        fx.children(&["a", "b", "c"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        assert!(matches!(callback.admit_next(), Admission::Aborted { .. }));
        assert_eq!(fx.error_outs(), 1);
        assert!(fx.engine.started().is_empty());
    }

    #[test]
    fn test_lock_service_error_aborts_fan_out() {
        let mut fx = Fixture::new();
        fx.services.locker = Arc::new(BrokenLocker);
        fx.children(&["a", "b", "c"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        let admission = callback.admit_next();

        match admission {
            Admission::Aborted { reason } => assert!(reason.contains("backend unavailable")),
            other => panic!("expected abort, got {:?}", other),
        }
        assert_eq!(fx.error_outs(), 1);
    }

    #[test]
    fn test_abort_reports_errored_children() {
        let fx = Fixture::new();
        fx.children(&["a", "b", "c"], 2);
        fx.node_store
            .update_status("a", ExecutionStatus::Succeeded)
            .unwrap();
        fx.services.child_instances.remove("p").unwrap();

        let scheduler = fx.scheduler();
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        fx.wait_notify
            .wait_for_all_on(
                PUBLISHER,
                Arc::new(ResumeParentCallback::new(fx.engine.clone(), "p".to_string())),
                &ids,
            )
            .unwrap();
        fx.wait_notify
            .done_with("a", NotifyResponse::new("a", ExecutionStatus::Succeeded))
            .unwrap();

        let callback = MaxConcurrentChildCallback::new(scheduler, "p", 2);
        assert!(matches!(callback.admit_next(), Admission::Aborted { .. }));

        assert_eq!(fx.node_store.get("b").unwrap().status, ExecutionStatus::Errored);
        assert_eq!(fx.node_store.get("c").unwrap().status, ExecutionStatus::Errored);
        assert!(fx.wait_notify.is_done("b"));
        assert!(fx.wait_notify.is_done("c"));
        assert_eq!(
            fx.engine.resumed.lock().unwrap().clone(),
            vec![("p".to_string(), 3)]
        );
    }

    #[test]
    fn test_concurrent_completions_admit_distinct_children() {
        let fx = Fixture::new();
        fx.children(&["a", "b", "c", "d"], 2);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 2);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let callback = Arc::clone(&callback);
                thread::spawn(move || callback.admit_next())
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.join().unwrap(), Admission::Admitted { .. }));
        }

        let mut started = fx.engine.started();
        started.sort();
        assert_eq!(started, vec!["c", "d"]);
        assert_eq!(fx.error_outs(), 0);
    }

    #[test]
    fn test_start_with_zero_children() {
        let fx = Fixture::new();
        let parent = fx.parent();

        assert_eq!(fx.scheduler().start(&parent, &[], 2).unwrap(), 0);
        assert!(fx.services.child_instances.get("p").unwrap().is_none());
        assert!(fx.engine.started().is_empty());
    }

    #[test]
    fn test_start_admits_first_batch() {
        let fx = Fixture::new();
        let parent = fx.parent();

        let count = fx
            .scheduler()
            .start(&parent, &nodes(&["a", "b", "c"]), 2)
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(fx.engine.started().len(), 2);
        let instance = fx.services.child_instances.get("p").unwrap().unwrap();
        assert_eq!(instance.cursor, 2);
        assert_eq!(instance.children_node_execution_ids.len(), 3);

        let children = fx.node_store.find_children("p").unwrap();
        assert_eq!(children.len(), 3);
        for child in &children {
            assert_eq!(child.notify_id.as_deref(), Some(child.uuid.as_str()));
            let runtime_ids: Vec<_> = child
                .ambiance
                .levels()
                .iter()
                .map(|l| l.runtime_id.as_str())
                .collect();
            assert_eq!(runtime_ids, vec!["p", child.uuid.as_str()]);
        }
        // One resume registration plus one per started child.
        assert_eq!(fx.wait_notify.pending_waits(PUBLISHER), 3);
    }

    #[test]
    fn test_start_with_limit_above_child_count() {
        let fx = Fixture::new();
        let parent = fx.parent();

        fx.scheduler()
            .start(&parent, &nodes(&["a", "b", "c"]), 5)
            .unwrap();

        assert_eq!(fx.engine.started().len(), 3);
        let callback = MaxConcurrentChildCallback::new(fx.scheduler(), "p", 5);
        assert_eq!(callback.admit_next(), Admission::Exhausted);
    }

    #[test]
    fn test_children_run_through_in_order() {
        let fx = Fixture::new();
        let parent = fx.parent();
        fx.scheduler()
            .start(&parent, &nodes(&["a", "b", "c", "d"]), 1)
            .unwrap();

        // Finish each started child in turn; the next one gets admitted.
        for expected in 1..=4 {
            let started = fx.engine.started();
            assert_eq!(started.len(), expected);
            let current = started[expected - 1].clone();
            fx.node_store
                .update_status(&current, ExecutionStatus::Succeeded)
                .unwrap();
            fx.wait_notify
                .done_with(&current, NotifyResponse::new(&current, ExecutionStatus::Succeeded))
                .unwrap();
        }

        assert_eq!(fx.engine.started().len(), 4);
        assert_eq!(fx.engine.resumed.lock().unwrap().len(), 1);
        assert!(fx.services.child_instances.get("p").unwrap().is_none());
    }
}
