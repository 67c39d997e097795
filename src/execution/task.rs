use crate::error::{Result, TaroError};
use crate::job::InstanceReporter;

use super::error::ExecutionError;
use super::state::ExecutionState;

/// Signals accepted by [`Execution::interrupt`].
pub const INTERRUPT_SIGNALS: [i32; 2] = [libc::SIGKILL, libc::SIGTERM];

pub fn check_interrupt_signal(signal: i32) -> Result<()> {
    if INTERRUPT_SIGNALS.contains(&signal) {
        Ok(())
    } else {
        Err(TaroError::UnsupportedSignal(signal))
    }
}

/// A runnable task owned by a job instance.
///
/// A synchronous execution finishes inside [`execute`](Execution::execute) and
/// its instance is moved to `RUNNING` before the call. An asynchronous one may
/// return a non-terminal state; its instance is moved to `TRIGGERED` first and
/// later transitions arrive through the attached [`InstanceReporter`].
pub trait Execution: Send + Sync {
    fn is_async(&self) -> bool;

    /// Runs the task, returning the state reached or a classified failure.
    fn execute(&self) -> Result<ExecutionState, ExecutionError>;

    /// Current progress while executing, the result once finished, or `None`
    /// when progress monitoring is not supported.
    fn status(&self) -> Option<String>;

    /// Not yet executed: do not execute. Executing: stop gracefully.
    /// Finished: ignored.
    fn stop(&self);

    /// Like [`stop`](Execution::stop) but immediate, by sending `signal`.
    fn interrupt(&self, signal: i32) -> Result<()>;

    /// Called by the owning instance before [`execute`](Execution::execute).
    fn attach(&self, _reporter: InstanceReporter) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_kill_and_term_are_accepted() {
        assert!(check_interrupt_signal(9).is_ok());
        assert!(check_interrupt_signal(15).is_ok());
        assert!(matches!(
            check_interrupt_signal(2),
            Err(TaroError::UnsupportedSignal(2))
        ));
    }
}
