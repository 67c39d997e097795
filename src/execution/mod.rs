//! Execution framework: the states of an execution, the ledger recording
//! transitions between them, the failure type, and the contract a runnable
//! task implements.

mod error;
mod lifecycle;
mod state;
mod task;

pub use error::{ExecutionError, NotAFailureState};
pub use lifecycle::{
    Clock, ExecutionLifecycle, ExecutionLifecycleManagement, ManualClock, SystemClock,
};
pub use state::{ExecutionState, ExecutionStateGroup, GroupSet, GROUP_TABLE};
pub use task::{check_interrupt_signal, Execution, INTERRUPT_SIGNALS};
