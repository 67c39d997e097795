//! Helpers for observing instances from tests and from callers that need to
//! block until an instance reaches a given state.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::execution::{check_interrupt_signal, Execution, ExecutionError, ExecutionState};
use crate::job::{
    ExecutionStateObserver, InstanceReporter, JobInfo, JobOutputObserver, Warn, WarnEventCtx,
    WarningObserver,
};

/// Blocks until an instance, possibly in another thread, reaches a state.
///
/// Register [`StateWaiter::observer`] on the instance, then call
/// [`wait_for_state`](StateWaiter::wait_for_state).
pub struct StateWaiter {
    sender: Sender<ExecutionState>,
    receiver: Receiver<ExecutionState>,
}

impl StateWaiter {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub fn observer(&self) -> impl ExecutionStateObserver + 'static {
        let sender = Mutex::new(self.sender.clone());
        move |info: &JobInfo| {
            let _ = sender
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .send(info.state());
        }
    }

    pub fn wait_for_state(
        &self,
        state: ExecutionState,
        timeout: Duration,
    ) -> Result<(), RecvTimeoutError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.receiver.recv_timeout(remaining)? == state {
                return Ok(());
            }
        }
    }
}

impl Default for StateWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct RecordingStateObserver {
    infos: Mutex<Vec<JobInfo>>,
}

impl RecordingStateObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn infos(&self) -> Vec<JobInfo> {
        self.infos.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn states(&self) -> Vec<ExecutionState> {
        self.infos().iter().map(JobInfo::state).collect()
    }

    pub fn last_state(&self, job_id: &str) -> Option<ExecutionState> {
        self.infos()
            .iter()
            .rev()
            .find(|i| i.job_id == job_id)
            .map(JobInfo::state)
    }
}

impl ExecutionStateObserver for RecordingStateObserver {
    fn state_update(&self, job_info: &JobInfo) {
        self.infos
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job_info.clone());
    }
}

#[derive(Default)]
pub struct RecordingWarningObserver {
    warnings: Mutex<Vec<(JobInfo, Warn, WarnEventCtx)>>,
}

impl RecordingWarningObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self, name: &str) -> Option<(JobInfo, Warn, WarnEventCtx)> {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|(_, w, _)| w.name == name)
            .cloned()
    }
}

impl WarningObserver for RecordingWarningObserver {
    fn new_warning(&self, job_info: &JobInfo, warning: &Warn, event_ctx: WarnEventCtx) {
        self.warnings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((job_info.clone(), warning.clone(), event_ctx));
    }
}

#[derive(Default)]
pub struct RecordingOutputObserver {
    lines: Mutex<Vec<String>>,
}

impl RecordingOutputObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl JobOutputObserver for RecordingOutputObserver {
    fn output_update(&self, _job_info: &JobInfo, output: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(output.to_string());
    }
}

enum Behavior {
    Complete,
    Async,
    Fail(ExecutionError),
    Panic(String),
    Block,
}

#[derive(Default)]
struct Control {
    released: bool,
    stopped: bool,
    interrupted: Option<i32>,
}

/// Scriptable [`Execution`] for exercising instances without real processes.
pub struct TestExecution {
    behavior: Behavior,
    control: Mutex<Control>,
    changed: Condvar,
    reporter: Mutex<Option<InstanceReporter>>,
}

impl TestExecution {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            control: Mutex::new(Control::default()),
            changed: Condvar::new(),
            reporter: Mutex::new(None),
        }
    }

    pub fn completing() -> Self {
        Self::with_behavior(Behavior::Complete)
    }

    /// Returns `TRIGGERED` and leaves further transitions to the test.
    pub fn asynchronous() -> Self {
        Self::with_behavior(Behavior::Async)
    }

    pub fn failing(error: ExecutionError) -> Self {
        Self::with_behavior(Behavior::Fail(error))
    }

    pub fn panicking(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Panic(message.into()))
    }

    /// Runs until released, stopped or interrupted.
    pub fn blocking() -> Self {
        Self::with_behavior(Behavior::Block)
    }

    pub fn release(&self) {
        self.control.lock().unwrap_or_else(|e| e.into_inner()).released = true;
        self.changed.notify_all();
    }

    pub fn reporter(&self) -> Option<InstanceReporter> {
        self.reporter.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Execution for TestExecution {
    fn is_async(&self) -> bool {
        matches!(self.behavior, Behavior::Async)
    }

    fn execute(&self) -> Result<ExecutionState, ExecutionError> {
        match &self.behavior {
            Behavior::Complete => Ok(ExecutionState::Completed),
            Behavior::Async => Ok(ExecutionState::Triggered),
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Block => {
                let mut control = self.control.lock().unwrap_or_else(|e| e.into_inner());
                while !control.released && !control.stopped && control.interrupted.is_none() {
                    control = self
                        .changed
                        .wait(control)
                        .unwrap_or_else(|e| e.into_inner());
                }
                if let Some(signal) = control.interrupted {
                    Err(ExecutionError::interrupted(format!("Interrupted by signal {signal}")))
                } else if control.stopped {
                    Ok(ExecutionState::Stopped)
                } else {
                    Ok(ExecutionState::Completed)
                }
            }
        }
    }

    fn status(&self) -> Option<String> {
        None
    }

    fn stop(&self) {
        self.control.lock().unwrap_or_else(|e| e.into_inner()).stopped = true;
        self.changed.notify_all();
    }

    fn interrupt(&self, signal: i32) -> Result<()> {
        check_interrupt_signal(signal)?;
        self.control.lock().unwrap_or_else(|e| e.into_inner()).interrupted = Some(signal);
        self.changed.notify_all();
        Ok(())
    }

    fn attach(&self, reporter: InstanceReporter) {
        *self.reporter.lock().unwrap_or_else(|e| e.into_inner()) = Some(reporter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobInstance;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn waiter_sees_state_from_other_thread() {
        let execution = Arc::new(TestExecution::blocking());
        let inst = JobInstance::new("job", "w1", execution.clone());
        let waiter = StateWaiter::new();
        inst.add_state_observer(waiter.observer());

        let runner = inst.clone();
        let handle = thread::spawn(move || runner.run());

        waiter
            .wait_for_state(ExecutionState::Running, Duration::from_secs(5))
            .unwrap();
        execution.release();
        waiter
            .wait_for_state(ExecutionState::Completed, Duration::from_secs(5))
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn waiter_times_out() {
        let waiter = StateWaiter::new();
        assert!(waiter
            .wait_for_state(ExecutionState::Completed, Duration::from_millis(20))
            .is_err());
    }

    #[test]
    fn blocking_execution_stops() {
        let execution = Arc::new(TestExecution::blocking());
        let inst = JobInstance::new("job", "w2", execution.clone());
        let runner = inst.clone();
        let handle = thread::spawn(move || runner.run());
        inst.stop();
        handle.join().unwrap();
        assert_eq!(inst.state(), ExecutionState::Stopped);
    }
}
