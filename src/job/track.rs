//! Structured sub-progress of a job instance.
//!
//! The mutable tree ([`TrackedTask`] → [`Operation`] → [`Progress`]) is owned by
//! the instance. Observers and remote clients only ever see the immutable
//! `*Info` snapshots.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_MAX_EVENTS: usize = 100;

/// Snapshot of a progress counter.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressInfo {
    #[serde(default)]
    pub completed: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl ProgressInfo {
    pub fn new(completed: Option<f64>, total: Option<f64>) -> Self {
        Self {
            completed,
            total,
            ..Self::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Fraction done, `None` unless both values are known and total is non-zero.
    pub fn pct_done(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total != 0.0 => Some(completed / total),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!((self.completed, self.total), (Some(c), Some(t)) if c == t)
    }
}

impl Serialize for ProgressInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ProgressInfo", 6)?;
        s.serialize_field("completed", &self.completed)?;
        s.serialize_field("total", &self.total)?;
        s.serialize_field("unit", &self.unit)?;
        s.serialize_field("last_updated_at", &self.last_updated_at)?;
        s.serialize_field("pct_done", &self.pct_done())?;
        s.serialize_field("is_finished", &self.is_finished())?;
        s.end()
    }
}

fn fmt_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{v}"),
        None => "?".to_string(),
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", fmt_number(self.completed), fmt_number(self.total))?;
        if !self.unit.is_empty() {
            write!(f, " {}", self.unit)?;
        }
        if let Some(pct) = self.pct_done() {
            write!(f, " ({:.0}%)", pct * 100.0)?;
        }
        Ok(())
    }
}

/// Mutable progress counter.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    info: ProgressInfo,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or with `increment`, adds to) the completed amount. `total` and
    /// `unit` are only overwritten when given.
    pub fn update(
        &mut self,
        completed: f64,
        total: Option<f64>,
        unit: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        increment: bool,
    ) {
        self.info.completed = match (self.info.completed, increment) {
            (Some(current), true) => Some(current + completed),
            _ => Some(completed),
        };
        if total.is_some() {
            self.info.total = total;
        }
        if let Some(unit) = unit.filter(|u| !u.is_empty()) {
            self.info.unit = unit.to_string();
        }
        self.info.last_updated_at = timestamp;
    }

    pub fn completed(&self) -> Option<f64> {
        self.info.completed
    }

    pub fn total(&self) -> Option<f64> {
        self.info.total
    }

    pub fn is_finished(&self) -> bool {
        self.info.is_finished()
    }

    pub fn info(&self) -> ProgressInfo {
        self.info.clone()
    }
}

/// Snapshot of a named operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub name: String,
    #[serde(default)]
    pub progress: ProgressInfo,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl fmt::Display for OperationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.progress)
    }
}

/// A named unit of work with its own progress.
#[derive(Debug, Clone)]
pub struct Operation {
    name: String,
    progress: Progress,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            progress: Progress::new(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// First update starts the operation; the update finishing its progress ends it.
    pub fn update(
        &mut self,
        completed: f64,
        total: Option<f64>,
        unit: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        increment: bool,
    ) {
        if self.started_at.is_none() {
            self.started_at = timestamp;
        }
        self.progress
            .update(completed, total, unit, timestamp, increment);
        if self.ended_at.is_none() && self.progress.is_finished() {
            self.ended_at = timestamp;
        }
    }

    pub fn info(&self) -> OperationInfo {
        OperationInfo {
            name: self.name.clone(),
            progress: self.progress.info(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Snapshot of a tracked task tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackedTaskInfo {
    pub name: String,
    #[serde(default)]
    pub events: Vec<(String, DateTime<Utc>)>,
    #[serde(default)]
    pub operations: Vec<OperationInfo>,
    #[serde(default)]
    pub subtasks: Vec<TrackedTaskInfo>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TrackedTaskInfo {
    pub fn last_event(&self) -> Option<&(String, DateTime<Utc>)> {
        self.events.last()
    }
}

impl fmt::Display for TrackedTaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let earliest_op = self
            .operations
            .iter()
            .filter_map(|op| op.started_at)
            .min();

        let mut parts = Vec::new();
        if let Some((event, ts)) = self.last_event() {
            if earliest_op.is_none_or(|op_ts| *ts > op_ts) {
                let local = ts.with_timezone(&Local);
                parts.push(format!("{} {event}", local.format("%H:%M:%S%.3f")));
            }
        }
        parts.extend(
            self.operations
                .iter()
                .filter(|op| !op.progress.is_finished())
                .map(|op| op.to_string()),
        );
        f.write_str(&parts.join(" | "))
    }
}

/// Mutable task tree node with a bounded event history.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    name: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    max_events: usize,
    events: VecDeque<(String, DateTime<Utc>)>,
    operations: Vec<Operation>,
    subtasks: Vec<TrackedTask>,
}

impl TrackedTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_max_events(name, DEFAULT_MAX_EVENTS)
    }

    pub fn with_max_events(name: impl Into<String>, max_events: usize) -> Self {
        Self {
            name: name.into(),
            started_at: None,
            ended_at: None,
            max_events,
            events: VecDeque::with_capacity(max_events.min(DEFAULT_MAX_EVENTS)),
            operations: Vec::new(),
            subtasks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        self.started_at.get_or_insert(at);
    }

    pub fn end(&mut self, at: DateTime<Utc>) {
        self.ended_at.get_or_insert(at);
    }

    /// Appends an event, discarding the oldest one when the history is full.
    pub fn add_event(&mut self, name: impl Into<String>, timestamp: DateTime<Utc>) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back((name.into(), timestamp));
    }

    pub fn events(&self) -> impl Iterator<Item = &(String, DateTime<Utc>)> {
        self.events.iter()
    }

    pub fn last_event(&self) -> Option<&(String, DateTime<Utc>)> {
        self.events.back()
    }

    /// Returns the named operation, creating it on first access.
    pub fn operation(&mut self, name: &str) -> &mut Operation {
        let idx = match self.operations.iter().position(|op| op.name == name) {
            Some(idx) => idx,
            None => {
                self.operations.push(Operation::new(name));
                self.operations.len() - 1
            }
        };
        &mut self.operations[idx]
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Returns the named subtask, creating it on first access.
    pub fn subtask(&mut self, name: &str) -> &mut TrackedTask {
        let idx = match self.subtasks.iter().position(|t| t.name == name) {
            Some(idx) => idx,
            None => {
                self.subtasks.push(TrackedTask::with_max_events(name, self.max_events));
                self.subtasks.len() - 1
            }
        };
        &mut self.subtasks[idx]
    }

    pub fn subtasks(&self) -> &[TrackedTask] {
        &self.subtasks
    }

    pub fn info(&self) -> TrackedTaskInfo {
        TrackedTaskInfo {
            name: self.name.clone(),
            events: self.events.iter().cloned().collect(),
            operations: self.operations.iter().map(Operation::info).collect(),
            subtasks: self.subtasks.iter().map(TrackedTask::info).collect(),
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}
