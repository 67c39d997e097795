use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Groups an execution state may belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionStateGroup {
    BeforeExecution,
    Executing,
    Terminal,
    NotExecuted,
    Failure,
}

impl ExecutionStateGroup {
    const fn bit(self) -> u8 {
        match self {
            ExecutionStateGroup::BeforeExecution => 1,
            ExecutionStateGroup::Executing => 1 << 1,
            ExecutionStateGroup::Terminal => 1 << 2,
            ExecutionStateGroup::NotExecuted => 1 << 3,
            ExecutionStateGroup::Failure => 1 << 4,
        }
    }
}

/// Immutable set of [`ExecutionStateGroup`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GroupSet(u8);

impl GroupSet {
    pub const EMPTY: GroupSet = GroupSet(0);

    const fn of(groups: &[ExecutionStateGroup]) -> GroupSet {
        let mut bits = 0;
        let mut i = 0;
        while i < groups.len() {
            bits |= groups[i].bit();
            i += 1;
        }
        GroupSet(bits)
    }

    pub const fn contains(self, group: ExecutionStateGroup) -> bool {
        self.0 & group.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// State of a job instance execution.
///
/// Membership is fixed. Each state maps to its groups through [`GROUP_TABLE`],
/// so all the `is_*` queries are a single table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    None,
    Created,

    Disabled,

    /// Held until released.
    Pending,
    /// Waiting for another job.
    Waiting,

    /// Start requested, confirmation not (yet) received.
    Triggered,
    Started,
    Running,

    Completed,
    Stopped,

    Cancelled,
    Skipped,
    Suspended,

    StartFailed,
    Interrupted,
    Failed,
    Error,
}

use ExecutionStateGroup::{BeforeExecution, Executing, Failure, NotExecuted, Terminal};

/// Group membership per state, indexed by the enum discriminant.
pub const GROUP_TABLE: [GroupSet; 17] = [
    GroupSet::EMPTY,                      // None
    GroupSet::of(&[BeforeExecution]),     // Created
    GroupSet::of(&[Terminal]),            // Disabled
    GroupSet::of(&[BeforeExecution]),     // Pending
    GroupSet::of(&[BeforeExecution]),     // Waiting
    GroupSet::of(&[Executing]),           // Triggered
    GroupSet::of(&[Executing]),           // Started
    GroupSet::of(&[Executing]),           // Running
    GroupSet::of(&[Terminal]),            // Completed
    GroupSet::of(&[Terminal]),            // Stopped
    GroupSet::of(&[Terminal, NotExecuted]), // Cancelled
    GroupSet::of(&[Terminal, NotExecuted]), // Skipped
    GroupSet::of(&[Terminal, NotExecuted]), // Suspended
    GroupSet::of(&[Terminal, Failure]),   // StartFailed
    GroupSet::of(&[Terminal, Failure]),   // Interrupted
    GroupSet::of(&[Terminal, Failure]),   // Failed
    GroupSet::of(&[Terminal, Failure]),   // Error
];

impl ExecutionState {
    pub const ALL: [ExecutionState; 17] = [
        ExecutionState::None,
        ExecutionState::Created,
        ExecutionState::Disabled,
        ExecutionState::Pending,
        ExecutionState::Waiting,
        ExecutionState::Triggered,
        ExecutionState::Started,
        ExecutionState::Running,
        ExecutionState::Completed,
        ExecutionState::Stopped,
        ExecutionState::Cancelled,
        ExecutionState::Skipped,
        ExecutionState::Suspended,
        ExecutionState::StartFailed,
        ExecutionState::Interrupted,
        ExecutionState::Failed,
        ExecutionState::Error,
    ];

    pub const fn groups(self) -> GroupSet {
        GROUP_TABLE[self as usize]
    }

    pub const fn is_before_execution(self) -> bool {
        self.groups().contains(BeforeExecution)
    }

    pub const fn is_executing(self) -> bool {
        self.groups().contains(Executing)
    }

    pub const fn is_terminal(self) -> bool {
        self.groups().contains(Terminal)
    }

    pub const fn is_not_executed(self) -> bool {
        self.groups().contains(NotExecuted)
    }

    pub const fn is_failure(self) -> bool {
        self.groups().contains(Failure)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionState::None => "NONE",
            ExecutionState::Created => "CREATED",
            ExecutionState::Disabled => "DISABLED",
            ExecutionState::Pending => "PENDING",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Triggered => "TRIGGERED",
            ExecutionState::Started => "STARTED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completed => "COMPLETED",
            ExecutionState::Stopped => "STOPPED",
            ExecutionState::Cancelled => "CANCELLED",
            ExecutionState::Skipped => "SKIPPED",
            ExecutionState::Suspended => "SUSPENDED",
            ExecutionState::StartFailed => "START_FAILED",
            ExecutionState::Interrupted => "INTERRUPTED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown execution state: {s}"))
    }
}
