mod info;
mod instance;
mod observer;
pub mod track;

pub use info::{wildcard_match, JobInfo, Warn, WarnEventCtx};
pub use instance::{generate_instance_id, InstanceReporter, JobInstance, LAST_OUTPUT_LINES};
pub(crate) use observer::panic_message;
pub use observer::{
    ExecutionStateObserver, JobOutputObserver, ObserverId, ObserverRegistry, WarningObserver,
};
pub use track::{
    Operation, OperationInfo, Progress, ProgressInfo, TrackedTask, TrackedTaskInfo,
};
