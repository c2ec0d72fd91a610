//! External Collaborators
//!
//! Narrow interfaces the engine consumes from the rest of the system, with
//! process-local implementations used by the CLI and the tests.
//!
//! - [`node_store`]: Node execution records
//! - [`plan_store`]: Plan executions and plan node lookup
//! - [`child_instance`]: Fan-out admission cursors
//! - [`lock`]: Lock service with bounded wait and TTL
//! - [`notify`]: Wait/notify completion engine

pub mod child_instance;
pub mod lock;
pub mod node_store;
pub mod notify;
pub mod plan_store;

use std::sync::Arc;

pub use child_instance::{
    ConcurrentChildInstance, ConcurrentChildInstanceService, InMemoryChildInstanceStore,
};
pub use lock::{AcquiredLock, InMemoryLocker, PersistentLocker};
pub use node_store::{InMemoryNodeStore, NodeExecutionService};
pub use notify::{InMemoryWaitNotify, NotifyCallback, NotifyResponse, WaitNotifyEngine};
pub use plan_store::{InMemoryPlanStore, PlanExecution, PlanExecutionService};

/// The collaborators an engine is wired with.
#[derive(Clone)]
pub struct EngineServices {
    pub node_store: Arc<dyn NodeExecutionService>,
    pub plan_store: Arc<dyn PlanExecutionService>,
    pub child_instances: Arc<dyn ConcurrentChildInstanceService>,
    pub locker: Arc<dyn PersistentLocker>,
    pub wait_notify: Arc<dyn WaitNotifyEngine>,
}

impl EngineServices {
    /// Wires every collaborator with its in-memory implementation.
    pub fn in_memory() -> Self {
        Self {
            node_store: Arc::new(InMemoryNodeStore::new()),
            plan_store: Arc::new(InMemoryPlanStore::new()),
            child_instances: Arc::new(InMemoryChildInstanceStore::new()),
            locker: Arc::new(InMemoryLocker::new()),
            wait_notify: Arc::new(InMemoryWaitNotify::new()),
        }
    }
}
