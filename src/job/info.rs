use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::{ExecutionError, ExecutionLifecycle, ExecutionState};

use super::track::TrackedTaskInfo;

/// A named warning event with free-form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warn {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Warn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Delivery context of a warning: how many times it fired for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnEventCtx {
    pub count: u32,
}

/// Immutable snapshot of a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub instance_id: String,
    pub lifecycle: ExecutionLifecycle,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub warnings: BTreeMap<String, u32>,
    #[serde(default)]
    pub exec_error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking: Option<TrackedTaskInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_output: Vec<String>,
}

impl JobInfo {
    pub fn state(&self) -> ExecutionState {
        self.lifecycle.state()
    }

    /// Shell-style wildcard match against the job id or the instance id.
    /// An empty pattern matches everything.
    pub fn matches(&self, pattern: &str) -> bool {
        pattern.is_empty() || wildcard_match(pattern, &self.job_id) || wildcard_match(pattern, &self.instance_id)
    }
}

impl fmt::Display for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.job_id, self.instance_id, self.state())
    }
}

/// `*` matches any run of characters, `?` exactly one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}
