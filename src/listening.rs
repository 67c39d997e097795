//! State change subscriptions across processes.
//!
//! Each hosting process broadcasts its transitions to every `.listener`
//! socket with a [`StateDispatcher`]. A [`StateReceiver`] owns one such
//! socket and forwards the matching events to its own observers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::execution::ExecutionState;
use crate::job::{
    generate_instance_id, ExecutionStateObserver, JobInfo, ObserverId, ObserverRegistry,
};
use crate::paths;
use crate::socket::{RequestHandler, SocketClient, SocketServer};

pub const LISTENER_EXTENSION: &str = "listener";

const STATE_CHANGE_EVENT: &str = "execution_state_change";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEvent {
    event_type: String,
    job_info: JobInfo,
}

/// State observer publishing every transition to all listener sockets.
pub struct StateDispatcher {
    client: Mutex<SocketClient>,
}

impl StateDispatcher {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client: Mutex::new(SocketClient::new(dir, LISTENER_EXTENSION, false)?),
        })
    }

    fn dispatch(&self, job_info: &JobInfo) -> Result<()> {
        let event = serde_json::to_value(StateEvent {
            event_type: STATE_CHANGE_EVENT.to_string(),
            job_info: job_info.clone(),
        })?;
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .communicate(&event, &[])?;
        Ok(())
    }
}

impl ExecutionStateObserver for StateDispatcher {
    fn state_update(&self, job_info: &JobInfo) {
        if let Err(e) = self.dispatch(job_info) {
            tracing::warn!(instance_id = %job_info.instance_id, error = %e, "state_dispatch_failed");
        }
    }
}

/// Selects which received events are forwarded.
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    /// Wildcard pattern on job or instance id; empty matches all.
    pub instance_match: String,
    /// Accepted states; empty accepts all.
    pub states: Vec<ExecutionState>,
}

impl StateFilter {
    pub fn matches(&self, job_info: &JobInfo) -> bool {
        job_info.matches(&self.instance_match)
            && (self.states.is_empty() || self.states.contains(&job_info.state()))
    }
}

struct ReceiverHandler {
    filter: StateFilter,
    observers: Arc<ObserverRegistry<dyn ExecutionStateObserver>>,
}

impl RequestHandler for ReceiverHandler {
    fn handle(&self, request: Value) -> Option<Value> {
        let event: StateEvent = match serde_json::from_value(request) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "invalid_state_event");
                return None;
            }
        };
        if event.event_type != STATE_CHANGE_EVENT {
            tracing::debug!(event_type = %event.event_type, "unknown_event_type");
            return None;
        }
        if self.filter.matches(&event.job_info) {
            self.observers.notify(|o| o.state_update(&event.job_info));
        }
        None
    }
}

/// Listener socket delivering state changes of all instances to observers.
pub struct StateReceiver {
    server: SocketServer,
    observers: Arc<ObserverRegistry<dyn ExecutionStateObserver>>,
}

impl StateReceiver {
    pub fn start(dir: &Path, filter: StateFilter) -> Result<Self> {
        let observers = Arc::new(ObserverRegistry::new("receiver"));
        let handler = ReceiverHandler {
            filter,
            observers: Arc::clone(&observers),
        };
        let path = paths::socket_path(dir, &generate_instance_id(), LISTENER_EXTENSION);
        let server = SocketServer::start(path, Arc::new(handler))?;
        Ok(Self { server, observers })
    }

    pub fn add_observer<O>(&self, observer: O) -> ObserverId
    where
        O: ExecutionStateObserver + 'static,
    {
        self.observers.add(Arc::new(observer), None)
    }

    pub fn add_observer_with_priority<O>(&self, observer: O, priority: Option<i32>) -> ObserverId
    where
        O: ExecutionStateObserver + 'static,
    {
        self.observers.add(Arc::new(observer), priority)
    }

    pub fn add_shared_observer(
        &self,
        observer: Arc<dyn ExecutionStateObserver>,
        priority: Option<i32>,
    ) -> ObserverId {
        self.observers.add(observer, priority)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers.remove(id)
    }

    pub fn path(&self) -> &Path {
        self.server.path()
    }

    pub fn close(&mut self) {
        self.server.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInstance;
    use crate::testing::{RecordingStateObserver, StateWaiter, TestExecution};
    use std::time::Duration;

    #[test]
    fn transitions_reach_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let receiver = StateReceiver::start(dir.path(), StateFilter::default()).unwrap();
        let waiter = StateWaiter::new();
        receiver.add_observer(waiter.observer());

        let inst = JobInstance::new("job", "l1", Arc::new(TestExecution::completing()));
        inst.add_state_observer(StateDispatcher::new(dir.path()).unwrap());
        inst.run();

        waiter
            .wait_for_state(ExecutionState::Running, Duration::from_secs(2))
            .unwrap();
        waiter
            .wait_for_state(ExecutionState::Completed, Duration::from_secs(2))
            .unwrap();
    }

    #[test]
    fn filter_selects_states_and_instances() {
        let dir = tempfile::tempdir().unwrap();
        let filter = StateFilter {
            instance_match: "wanted*".into(),
            states: vec![ExecutionState::Completed],
        };
        let receiver = StateReceiver::start(dir.path(), filter).unwrap();
        let recorder = Arc::new(RecordingStateObserver::new());
        receiver.add_shared_observer(recorder.clone(), None);
        let waiter = StateWaiter::new();
        receiver.add_observer(waiter.observer());

        for job_id in ["ignored", "wanted"] {
            let inst = JobInstance::new(job_id, generate_instance_id(), Arc::new(TestExecution::completing()));
            inst.add_state_observer(StateDispatcher::new(dir.path()).unwrap());
            inst.run();
        }

        waiter
            .wait_for_state(ExecutionState::Completed, Duration::from_secs(2))
            .unwrap();
        let infos = recorder.infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].job_id, "wanted");
    }

    #[test]
    fn dispatcher_without_listeners_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let inst = JobInstance::new("job", "l2", Arc::new(TestExecution::completing()));
        inst.add_state_observer(StateDispatcher::new(dir.path()).unwrap());
        inst.run();
        assert_eq!(inst.state(), ExecutionState::Completed);
    }

    #[test]
    fn close_removes_listener_socket() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = StateReceiver::start(dir.path(), StateFilter::default()).unwrap();
        let path = receiver.path().to_path_buf();
        assert!(path.exists());
        receiver.close();
        assert!(!path.exists());
    }
}
