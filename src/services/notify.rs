//! Wait/Notify Engine
//!
//! Completion publish/subscribe: a caller registers a callback on one or
//! more correlation ids; once every id has been reported done, the callback
//! is invoked exactly once with the responses.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestrationError, Result};
use crate::execution::status::ExecutionStatus;

/// Payload reported when a unit of work finishes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    /// The node execution that finished
    pub node_execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NotifyResponse {
    pub fn new(node_execution_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            node_execution_id: node_execution_id.into(),
            status,
            error_message: None,
        }
    }

    pub fn errored(node_execution_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_execution_id: node_execution_id.into(),
            status: ExecutionStatus::Errored,
            error_message: Some(message.into()),
        }
    }
}

/// Invoked once all correlation ids of a registration are done.
///
/// `responses` is keyed by correlation id.
pub trait NotifyCallback: Send + Sync {
    fn notify(&self, responses: &HashMap<String, NotifyResponse>);
}

/// Publish/subscribe completion mechanism.
pub trait WaitNotifyEngine: Send + Sync {
    /// Registers `callback` to run once every id in `correlation_ids` is done.
    ///
    /// Ids that are already done count immediately. Returns the wait id.
    fn wait_for_all_on(
        &self,
        publisher_name: &str,
        callback: Arc<dyn NotifyCallback>,
        correlation_ids: &[String],
    ) -> Result<String>;

    /// Reports the unit of work identified by `correlation_id` as done.
    fn done_with(&self, correlation_id: &str, response: NotifyResponse) -> Result<()>;

    /// Drops the stored responses of `correlation_ids` that no pending
    /// registration still waits on. Returns how many were dropped.
    fn forget(&self, correlation_ids: &[String]) -> Result<usize>;
}

struct WaitInstance {
    id: String,
    publisher_name: String,
    correlation_ids: Vec<String>,
    callback: Arc<dyn NotifyCallback>,
}

#[derive(Default)]
struct WaitState {
    responses: HashMap<String, NotifyResponse>,
    waits: Vec<WaitInstance>,
}

impl WaitState {
    fn all_done(&self, correlation_ids: &[String]) -> bool {
        correlation_ids.iter().all(|id| self.responses.contains_key(id))
    }

    fn collect(&self, correlation_ids: &[String]) -> HashMap<String, NotifyResponse> {
        correlation_ids
            .iter()
            .filter_map(|id| self.responses.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }
}

/// Wait/notify engine kept in process memory.
///
/// Responses stay stored until [`WaitNotifyEngine::forget`] drops them, so a
/// registration made after its ids finished still fires. Callbacks run on the thread that completes the registration (the
/// `done_with` caller, or the registrant when everything was already done),
/// never while the internal state lock is held.
#[derive(Default)]
pub struct InMemoryWaitNotify {
    state: Mutex<WaitState>,
}

impl InMemoryWaitNotify {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, WaitState>> {
        self.state
            .lock()
            .map_err(|_| OrchestrationError::store("wait/notify state poisoned"))
    }

    /// Number of registrations still waiting under `publisher_name`.
    pub fn pending_waits(&self, publisher_name: &str) -> usize {
        self.state()
            .map(|state| {
                state
                    .waits
                    .iter()
                    .filter(|w| w.publisher_name == publisher_name)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_done(&self, correlation_id: &str) -> bool {
        self.state()
            .map(|state| state.responses.contains_key(correlation_id))
            .unwrap_or(false)
    }
}

impl WaitNotifyEngine for InMemoryWaitNotify {
    fn wait_for_all_on(
        &self,
        publisher_name: &str,
        callback: Arc<dyn NotifyCallback>,
        correlation_ids: &[String],
    ) -> Result<String> {
        let wait_id = Uuid::new_v4().to_string();

        let ready = {
            let mut state = self.state()?;
            if state.all_done(correlation_ids) {
                Some(state.collect(correlation_ids))
            } else {
                state.waits.push(WaitInstance {
                    id: wait_id.clone(),
                    publisher_name: publisher_name.to_string(),
                    correlation_ids: correlation_ids.to_vec(),
                    callback: Arc::clone(&callback),
                });
                None
            }
        };

        match ready {
            Some(responses) => {
                debug!(
                    "Wait {} on {:?} already satisfied; notifying now",
                    wait_id, correlation_ids
                );
                callback.notify(&responses);
            }
            None => debug!(
                "Registered wait {} on {:?} under publisher '{}'",
                wait_id, correlation_ids, publisher_name
            ),
        }

        Ok(wait_id)
    }

    fn done_with(&self, correlation_id: &str, response: NotifyResponse) -> Result<()> {
        let ready: Vec<(WaitInstance, HashMap<String, NotifyResponse>)> = {
            let mut state = self.state()?;
            if state.responses.contains_key(correlation_id) {
                warn!("Correlation id {} already reported done; ignoring", correlation_id);
                return Ok(());
            }
            state.responses.insert(correlation_id.to_string(), response);

            let waits = std::mem::take(&mut state.waits);
            let (done, pending): (Vec<_>, Vec<_>) = waits
                .into_iter()
                .partition(|w| state.all_done(&w.correlation_ids));
            state.waits = pending;

            done.into_iter()
                .map(|w| {
                    let responses = state.collect(&w.correlation_ids);
                    (w, responses)
                })
                .collect()
        };

        for (wait, responses) in ready {
            debug!("Wait {} satisfied by {}", wait.id, correlation_id);
            wait.callback.notify(&responses);
        }
        Ok(())
    }

    fn forget(&self, correlation_ids: &[String]) -> Result<usize> {
        let mut state = self.state()?;
        let WaitState { responses, waits } = &mut *state;

        let referenced: HashSet<&str> = waits
            .iter()
            .flat_map(|w| w.correlation_ids.iter().map(String::as_str))
            .collect();

        let mut forgotten = 0;
        for id in correlation_ids {
            if !referenced.contains(id.as_str()) && responses.remove(id).is_some() {
                forgotten += 1;
            }
        }
        debug!("Forgot {} completed correlation ids", forgotten);
        Ok(forgotten)
    }
}
