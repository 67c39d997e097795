use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use uuid::Uuid;

use crate::error::Result;
use crate::execution::{
    check_interrupt_signal, Clock, Execution, ExecutionError, ExecutionLifecycle,
    ExecutionLifecycleManagement, ExecutionState,
};

use super::info::{JobInfo, Warn, WarnEventCtx};
use super::observer::{
    panic_message, ExecutionStateObserver, JobOutputObserver, ObserverId, ObserverRegistry,
    WarningObserver,
};
use super::track::TrackedTask;

/// How many of the most recent output lines an instance keeps.
pub const LAST_OUTPUT_LINES: usize = 10;

pub fn generate_instance_id() -> String {
    Uuid::new_v4().simple().to_string()
}

struct InstanceState {
    lifecycle: ExecutionLifecycleManagement,
    warnings: BTreeMap<String, u32>,
    exec_error: Option<ExecutionError>,
    tracking: Option<TrackedTask>,
    last_output: VecDeque<String>,
}

struct Inner {
    job_id: String,
    instance_id: String,
    execution: Arc<dyn Execution>,
    state: Mutex<InstanceState>,
    state_observers: ObserverRegistry<dyn ExecutionStateObserver>,
    warning_observers: ObserverRegistry<dyn WarningObserver>,
    output_observers: ObserverRegistry<dyn JobOutputObserver>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds a snapshot from already locked state, so it never mixes two
    /// versions of the ledger.
    fn info(&self, state: &InstanceState, status: Option<String>) -> JobInfo {
        let status = match &state.tracking {
            Some(task) => Some(task.info().to_string()).filter(|s| !s.is_empty()).or(status),
            None => status,
        };
        JobInfo {
            job_id: self.job_id.clone(),
            instance_id: self.instance_id.clone(),
            lifecycle: state.lifecycle.lifecycle().clone(),
            status,
            warnings: state.warnings.clone(),
            exec_error: state.exec_error.clone(),
            tracking: state.tracking.as_ref().map(TrackedTask::info),
            last_output: state.last_output.iter().cloned().collect(),
        }
    }

    fn create_info(&self) -> JobInfo {
        let status = self.execution.status();
        let state = self.lock();
        self.info(&state, status)
    }

    fn transition(&self, new_state: ExecutionState, error: Option<ExecutionError>) -> bool {
        let status = self.execution.status();
        let info = {
            let mut state = self.lock();
            if !state.lifecycle.set_state(new_state) {
                return false;
            }
            if error.is_some() {
                state.exec_error = error;
            }
            self.info(&state, status)
        };

        tracing::info!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            new_state = %new_state,
            "job_state_changed"
        );
        self.state_observers.notify(|o| o.state_update(&info));
        true
    }

    fn add_warning(&self, warning: Warn) {
        let status = self.execution.status();
        let (info, ctx) = {
            let mut state = self.lock();
            let count = state.warnings.entry(warning.name.clone()).or_insert(0);
            *count += 1;
            let ctx = WarnEventCtx { count: *count };
            (self.info(&state, status), ctx)
        };

        tracing::warn!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            warning = %warning.name,
            count = ctx.count,
            "new_warning"
        );
        self.warning_observers
            .notify(|o| o.new_warning(&info, &warning, ctx));
    }

    fn output(&self, line: &str) {
        let status = self.execution.status();
        let info = {
            let mut state = self.lock();
            if state.last_output.len() == LAST_OUTPUT_LINES {
                state.last_output.pop_front();
            }
            state.last_output.push_back(line.to_string());
            self.info(&state, status)
        };
        self.output_observers.notify(|o| o.output_update(&info, line));
    }

    fn track<R>(&self, update: impl FnOnce(&mut TrackedTask) -> R) -> R {
        let mut state = self.lock();
        let task = state
            .tracking
            .get_or_insert_with(|| TrackedTask::new(self.job_id.clone()));
        update(task)
    }
}

/// Live job instance.
///
/// Cheap to clone; clones share the same instance. Mutation only happens
/// through the instance's own methods, while snapshots may be taken from
/// any thread.
#[derive(Clone)]
pub struct JobInstance {
    inner: Arc<Inner>,
}

impl JobInstance {
    pub fn new(
        job_id: impl Into<String>,
        instance_id: impl Into<String>,
        execution: Arc<dyn Execution>,
    ) -> Self {
        Self::with_lifecycle(
            job_id,
            instance_id,
            execution,
            ExecutionLifecycleManagement::new(),
        )
    }

    pub fn with_clock(
        job_id: impl Into<String>,
        instance_id: impl Into<String>,
        execution: Arc<dyn Execution>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_lifecycle(
            job_id,
            instance_id,
            execution,
            ExecutionLifecycleManagement::with_clock(clock),
        )
    }

    fn with_lifecycle(
        job_id: impl Into<String>,
        instance_id: impl Into<String>,
        execution: Arc<dyn Execution>,
        mut lifecycle: ExecutionLifecycleManagement,
    ) -> Self {
        lifecycle.set_state(ExecutionState::Created);
        Self {
            inner: Arc::new(Inner {
                job_id: job_id.into(),
                instance_id: instance_id.into(),
                execution,
                state: Mutex::new(InstanceState {
                    lifecycle,
                    warnings: BTreeMap::new(),
                    exec_error: None,
                    tracking: None,
                    last_output: VecDeque::with_capacity(LAST_OUTPUT_LINES),
                }),
                state_observers: ObserverRegistry::new("state"),
                warning_observers: ObserverRegistry::new("warning"),
                output_observers: ObserverRegistry::new("output"),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn lifecycle(&self) -> ExecutionLifecycle {
        self.inner.lock().lifecycle.lifecycle().clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().lifecycle.state()
    }

    pub fn status(&self) -> Option<String> {
        self.create_info().status
    }

    pub fn warnings(&self) -> BTreeMap<String, u32> {
        self.inner.lock().warnings.clone()
    }

    pub fn exec_error(&self) -> Option<ExecutionError> {
        self.inner.lock().exec_error.clone()
    }

    pub fn last_output(&self) -> Vec<String> {
        self.inner.lock().last_output.iter().cloned().collect()
    }

    /// Consistent point-in-time snapshot of this instance.
    pub fn create_info(&self) -> JobInfo {
        self.inner.create_info()
    }

    /// Runs the execution to its first reported state and records the result.
    ///
    /// Panics inside the execution are turned into an `ERROR` state.
    pub fn run(&self) {
        let execution = Arc::clone(&self.inner.execution);
        execution.attach(self.reporter());

        let initial = if execution.is_async() {
            ExecutionState::Triggered
        } else {
            ExecutionState::Running
        };
        if !self.set_state(initial) && self.state().is_terminal() {
            tracing::warn!(instance_id = %self.instance_id(), "run_after_terminal_state");
            return;
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| execution.execute()))
            .unwrap_or_else(|payload| {
                Err(ExecutionError::from_unexpected(panic_message(payload.as_ref())))
            });

        match result {
            Ok(state) => {
                self.set_state(state);
            }
            Err(err) => {
                if err.exec_state == ExecutionState::Error {
                    tracing::error!(
                        instance_id = %self.instance_id(),
                        reason = err.unexpected_error.as_deref().unwrap_or(&err.message),
                        "unexpected_execution_error"
                    );
                }
                let state = err.exec_state;
                self.inner.transition(state, Some(err));
            }
        }
    }

    /// Records a state transition and notifies state observers.
    pub fn set_state(&self, new_state: ExecutionState) -> bool {
        self.inner.transition(new_state, None)
    }

    pub fn add_warning(&self, warning: Warn) {
        self.inner.add_warning(warning);
    }

    /// Records an output line and notifies output observers.
    pub fn output(&self, line: &str) {
        self.inner.output(line);
    }

    /// Mutates the tracked task of this instance, creating it on first use.
    pub fn track<R>(&self, update: impl FnOnce(&mut TrackedTask) -> R) -> R {
        self.inner.track(update)
    }

    pub fn stop(&self) {
        tracing::info!(instance_id = %self.instance_id(), "stop_requested");
        self.inner.execution.stop();
    }

    pub fn interrupt(&self, signal: i32) -> Result<()> {
        check_interrupt_signal(signal)?;
        tracing::info!(instance_id = %self.instance_id(), signal, "interrupt_requested");
        self.inner.execution.interrupt(signal)
    }

    pub fn reporter(&self) -> InstanceReporter {
        InstanceReporter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_state_observer<O>(&self, observer: O) -> ObserverId
    where
        O: ExecutionStateObserver + 'static,
    {
        self.inner.state_observers.add(Arc::new(observer), None)
    }

    pub fn add_state_observer_with_priority<O>(&self, observer: O, priority: Option<i32>) -> ObserverId
    where
        O: ExecutionStateObserver + 'static,
    {
        self.inner.state_observers.add(Arc::new(observer), priority)
    }

    /// Registers an observer that is also held elsewhere.
    pub fn add_shared_state_observer(
        &self,
        observer: Arc<dyn ExecutionStateObserver>,
        priority: Option<i32>,
    ) -> ObserverId {
        self.inner.state_observers.add(observer, priority)
    }

    pub fn remove_state_observer(&self, id: ObserverId) -> bool {
        self.inner.state_observers.remove(id)
    }

    pub fn add_warning_observer<O>(&self, observer: O) -> ObserverId
    where
        O: WarningObserver + 'static,
    {
        self.inner.warning_observers.add(Arc::new(observer), None)
    }

    pub fn add_warning_observer_with_priority<O>(&self, observer: O, priority: Option<i32>) -> ObserverId
    where
        O: WarningObserver + 'static,
    {
        self.inner.warning_observers.add(Arc::new(observer), priority)
    }

    /// Registers an observer that is also held elsewhere.
    pub fn add_shared_warning_observer(
        &self,
        observer: Arc<dyn WarningObserver>,
        priority: Option<i32>,
    ) -> ObserverId {
        self.inner.warning_observers.add(observer, priority)
    }

    pub fn remove_warning_observer(&self, id: ObserverId) -> bool {
        self.inner.warning_observers.remove(id)
    }

    pub fn add_output_observer<O>(&self, observer: O) -> ObserverId
    where
        O: JobOutputObserver + 'static,
    {
        self.inner.output_observers.add(Arc::new(observer), None)
    }

    pub fn add_output_observer_with_priority<O>(&self, observer: O, priority: Option<i32>) -> ObserverId
    where
        O: JobOutputObserver + 'static,
    {
        self.inner.output_observers.add(Arc::new(observer), priority)
    }

    /// Registers an observer that is also held elsewhere.
    pub fn add_shared_output_observer(
        &self,
        observer: Arc<dyn JobOutputObserver>,
        priority: Option<i32>,
    ) -> ObserverId {
        self.inner.output_observers.add(observer, priority)
    }

    pub fn remove_output_observer(&self, id: ObserverId) -> bool {
        self.inner.output_observers.remove(id)
    }
}

impl std::fmt::Debug for JobInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobInstance")
            .field("job_id", &self.inner.job_id)
            .field("instance_id", &self.inner.instance_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle through which an execution reports back to its instance.
///
/// Holds the instance weakly; once the instance is gone every call is a no-op.
#[derive(Clone)]
pub struct InstanceReporter {
    inner: Weak<Inner>,
}

impl InstanceReporter {
    pub fn set_state(&self, new_state: ExecutionState) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.transition(new_state, None))
    }

    /// Reports a failure of an asynchronous execution.
    pub fn fail(&self, error: ExecutionError) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            let state = error.exec_state;
            inner.transition(state, Some(error))
        })
    }

    pub fn add_warning(&self, warning: Warn) {
        if let Some(inner) = self.inner.upgrade() {
            inner.add_warning(warning);
        }
    }

    pub fn output(&self, line: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.output(line);
        }
    }

    pub fn track(&self, update: impl FnOnce(&mut TrackedTask)) {
        if let Some(inner) = self.inner.upgrade() {
            inner.track(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        RecordingOutputObserver, RecordingStateObserver, RecordingWarningObserver, TestExecution,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn instance(execution: TestExecution) -> (JobInstance, Arc<TestExecution>) {
        let execution = Arc::new(execution);
        let inst = JobInstance::new("job", "inst-1", execution.clone());
        (inst, execution)
    }

    #[test]
    fn sync_execution_runs_through_running() {
        let (inst, _) = instance(TestExecution::completing());
        let observer = Arc::new(RecordingStateObserver::new());
        inst.add_shared_state_observer(observer.clone(), None);

        inst.run();

        assert_eq!(
            observer.states(),
            vec![ExecutionState::Running, ExecutionState::Completed]
        );
        assert_eq!(
            inst.lifecycle().states(),
            vec![
                ExecutionState::Created,
                ExecutionState::Running,
                ExecutionState::Completed
            ]
        );
        assert!(inst.exec_error().is_none());
    }

    #[test]
    fn async_execution_is_triggered_then_reports() {
        let (inst, execution) = instance(TestExecution::asynchronous());
        let observer = Arc::new(RecordingStateObserver::new());
        inst.add_shared_state_observer(observer.clone(), None);

        inst.run();
        assert_eq!(inst.state(), ExecutionState::Triggered);

        let reporter = execution.reporter().unwrap();
        assert!(reporter.set_state(ExecutionState::Started));
        assert!(reporter.set_state(ExecutionState::Completed));
        assert_eq!(
            observer.states(),
            vec![
                ExecutionState::Triggered,
                ExecutionState::Started,
                ExecutionState::Completed
            ]
        );
    }

    #[test]
    fn failure_is_stored_on_instance() {
        let (inst, _) = instance(TestExecution::failing(ExecutionError::failed("bad exit")));
        inst.run();
        assert_eq!(inst.state(), ExecutionState::Failed);
        let info = inst.create_info();
        assert_eq!(info.exec_error.unwrap().message, "bad exit");
    }

    #[test]
    fn panicking_execution_becomes_error() {
        let (inst, _) = instance(TestExecution::panicking("kaboom"));
        inst.run();
        assert_eq!(inst.state(), ExecutionState::Error);
        let err = inst.exec_error().unwrap();
        assert_eq!(err.unexpected_error.as_deref(), Some("kaboom"));
    }

    fn faulty_observer(_: &JobInfo) {
        panic!("observer bug");
    }

    #[test]
    fn faulty_state_observer_does_not_break_others() {
        let (inst, _) = instance(TestExecution::completing());
        let first = Arc::new(RecordingStateObserver::new());
        let third = Arc::new(RecordingStateObserver::new());
        inst.add_shared_state_observer(first.clone(), None);
        inst.add_state_observer(faulty_observer);
        inst.add_shared_state_observer(third.clone(), None);

        inst.run();

        let expected = vec![ExecutionState::Running, ExecutionState::Completed];
        assert_eq!(first.states(), expected);
        assert_eq!(third.states(), expected);
        assert_eq!(inst.state(), ExecutionState::Completed);
    }

    #[test]
    fn closure_and_trait_observers_both_accepted() {
        let (inst, _) = instance(TestExecution::completing());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        inst.add_state_observer(move |_: &JobInfo| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        inst.add_state_observer(RecordingStateObserver::new());

        inst.run();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prioritized_closures_fire_before_plain_ones() {
        let (inst, _) = instance(TestExecution::completing());
        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str| {
            let order = order.clone();
            move |info: &JobInfo| {
                if info.state() == ExecutionState::Running {
                    order.lock().unwrap().push(name);
                }
            }
        };
        inst.add_state_observer(record("plain"));
        inst.add_state_observer_with_priority(record("second"), Some(20));
        inst.add_state_observer_with_priority(record("first"), Some(10));

        inst.run();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "plain"]);
    }

    #[test]
    fn removed_observer_is_not_notified() {
        let (inst, _) = instance(TestExecution::completing());
        let observer = Arc::new(RecordingStateObserver::new());
        let id = inst.add_shared_state_observer(observer.clone(), None);
        assert!(inst.remove_state_observer(id));

        inst.run();
        assert!(observer.states().is_empty());
    }

    #[test]
    fn warnings_accumulate_and_notify() {
        let (inst, _) = instance(TestExecution::completing());
        let observer = Arc::new(RecordingWarningObserver::new());
        inst.add_shared_warning_observer(observer.clone(), None);

        inst.add_warning(Warn::new("slow"));
        inst.add_warning(Warn::new("slow").with_param("secs", 30));
        inst.add_warning(Warn::new("disk"));

        assert_eq!(inst.warnings()["slow"], 2);
        assert_eq!(inst.warnings()["disk"], 1);
        let (info, warn, ctx) = observer.last("slow").unwrap();
        assert_eq!(ctx.count, 2);
        assert_eq!(warn.params["secs"], 30);
        assert_eq!(info.warnings["slow"], 2);
    }

    #[test]
    fn output_is_delivered_and_tail_bounded() {
        let (inst, _) = instance(TestExecution::completing());
        let observer = Arc::new(RecordingOutputObserver::new());
        inst.add_shared_output_observer(observer.clone(), None);

        for i in 0..15 {
            inst.output(&format!("line {i}"));
        }

        assert_eq!(observer.lines().len(), 15);
        let tail = inst.last_output();
        assert_eq!(tail.len(), LAST_OUTPUT_LINES);
        assert_eq!(tail.first().map(String::as_str), Some("line 5"));
        assert_eq!(inst.create_info().last_output, tail);
    }

    #[test]
    fn tracking_feeds_status() {
        let (inst, _) = instance(TestExecution::completing());
        inst.track(|task| {
            task.operation("copy")
                .update(1.0, Some(4.0), Some("files"), None, false)
        });
        assert_eq!(inst.status().as_deref(), Some("copy 1/4 files (25%)"));
        assert!(inst.create_info().tracking.is_some());
    }

    #[test]
    fn interrupt_rejects_unknown_signal() {
        let (inst, _) = instance(TestExecution::completing());
        assert!(inst.interrupt(2).is_err());
        assert!(inst.interrupt(15).is_ok());
    }

    #[test]
    fn reporter_outlives_instance_harmlessly() {
        let (inst, _) = instance(TestExecution::completing());
        let reporter = inst.reporter();
        drop(inst);
        assert!(!reporter.set_state(ExecutionState::Running));
        reporter.output("ignored");
    }

    #[test]
    fn observer_may_snapshot_during_notification() {
        let (inst, _) = instance(TestExecution::completing());
        let handle = inst.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        inst.add_state_observer(move |_: &JobInfo| {
            s.lock().unwrap().push(handle.create_info().state());
        });
        inst.run();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ExecutionState::Running, ExecutionState::Completed]
        );
    }
}
