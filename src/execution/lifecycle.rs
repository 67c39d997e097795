use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::state::ExecutionState;

/// Source of transition timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock, UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered record of state transitions of one job instance.
///
/// Each state appears at most once. Entries keep the position of their first
/// insertion; re-entering a state only refreshes its timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionLifecycle {
    changes: Vec<(ExecutionState, DateTime<Utc>)>,
}

impl ExecutionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a lifecycle from recorded transitions, deduplicating by state.
    pub fn from_changes<I>(changes: I) -> Self
    where
        I: IntoIterator<Item = (ExecutionState, DateTime<Utc>)>,
    {
        let mut lifecycle = Self::default();
        for (state, changed) in changes {
            if state != ExecutionState::None {
                lifecycle.record(state, changed);
            }
        }
        lifecycle
    }

    fn record(&mut self, state: ExecutionState, changed: DateTime<Utc>) {
        match self.changes.iter_mut().find(|(s, _)| *s == state) {
            Some(entry) => entry.1 = changed,
            None => self.changes.push((state, changed)),
        }
    }

    /// Current state, `NONE` when nothing was recorded yet.
    pub fn state(&self) -> ExecutionState {
        self.changes
            .last()
            .map(|(state, _)| *state)
            .unwrap_or(ExecutionState::None)
    }

    pub fn states(&self) -> Vec<ExecutionState> {
        self.changes.iter().map(|(state, _)| *state).collect()
    }

    pub fn state_changes(&self) -> &[(ExecutionState, DateTime<Utc>)] {
        &self.changes
    }

    pub fn changed(&self, state: ExecutionState) -> Option<DateTime<Utc>> {
        self.changes
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, changed)| *changed)
    }

    pub fn first_changed(&self) -> Option<DateTime<Utc>> {
        self.changes.first().map(|(_, changed)| *changed)
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.changes.last().map(|(_, changed)| *changed)
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn executed(&self) -> bool {
        self.execution_started().is_some()
    }

    pub fn execution_started(&self) -> Option<DateTime<Utc>> {
        self.changes
            .iter()
            .find(|(state, _)| state.is_executing())
            .map(|(_, changed)| *changed)
    }

    pub fn execution_finished(&self) -> Option<DateTime<Utc>> {
        let state = self.state();
        if !state.is_terminal() {
            return None;
        }
        self.changed(state)
    }

    pub fn execution_time(&self) -> Option<Duration> {
        let finished = self.execution_finished()?;
        let started = self.execution_started()?;
        Some(finished - started)
    }
}

impl fmt::Display for ExecutionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .changes
            .iter()
            .map(|(state, changed)| format!("{state}@{}", changed.to_rfc3339()))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

#[derive(Serialize, Deserialize)]
struct StateChange {
    state: ExecutionState,
    changed: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct LifecycleRepr {
    state_changes: Vec<StateChange>,
}

impl Serialize for ExecutionLifecycle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        LifecycleRepr {
            state_changes: self
                .changes
                .iter()
                .map(|(state, changed)| StateChange {
                    state: *state,
                    changed: *changed,
                })
                .collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExecutionLifecycle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = LifecycleRepr::deserialize(deserializer)?;
        Ok(Self::from_changes(
            repr.state_changes.into_iter().map(|c| (c.state, c.changed)),
        ))
    }
}

/// The only mutator of an [`ExecutionLifecycle`].
///
/// Terminal states are final: once the lifecycle reaches one, further
/// transitions are ignored and `set_state` returns `false`.
pub struct ExecutionLifecycleManagement {
    lifecycle: ExecutionLifecycle,
    clock: Arc<dyn Clock>,
}

impl ExecutionLifecycleManagement {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            lifecycle: ExecutionLifecycle::default(),
            clock,
        }
    }

    /// Records a transition into `new_state`.
    ///
    /// Returns `false` for `NONE`, for the current state, and after a
    /// terminal state was reached. Timestamps never go backwards within one
    /// lifecycle even when the clock does.
    pub fn set_state(&mut self, new_state: ExecutionState) -> bool {
        let current = self.lifecycle.state();
        if new_state == ExecutionState::None || new_state == current || current.is_terminal() {
            return false;
        }

        let mut now = self.clock.now();
        if let Some(last) = self.lifecycle.last_changed() {
            now = now.max(last);
        }
        self.lifecycle.record(new_state, now);
        true
    }

    pub fn lifecycle(&self) -> &ExecutionLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> ExecutionState {
        self.lifecycle.state()
    }
}

impl Default for ExecutionLifecycleManagement {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionLifecycleManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionLifecycleManagement")
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
