use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::state::ExecutionState;

/// Expected failure of an execution.
///
/// Always classified with a failure-group state. Unexpected causes are kept
/// as their rendered message so the error can cross process boundaries.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(try_from = "RawExecutionError")]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    pub exec_state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unexpected_error: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawExecutionError {
    message: String,
    exec_state: ExecutionState,
    #[serde(default)]
    unexpected_error: Option<String>,
    #[serde(default)]
    params: Map<String, Value>,
}

/// Raised when an [`ExecutionError`] is given a state outside the failure group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exec_state must be a failure, got {0}")]
pub struct NotAFailureState(pub ExecutionState);

impl TryFrom<RawExecutionError> for ExecutionError {
    type Error = NotAFailureState;

    fn try_from(raw: RawExecutionError) -> Result<Self, Self::Error> {
        let mut err = ExecutionError::try_new(raw.message, raw.exec_state)?;
        err.unexpected_error = raw.unexpected_error;
        err.params = raw.params;
        Ok(err)
    }
}

impl ExecutionError {
    pub fn try_new(
        message: impl Into<String>,
        exec_state: ExecutionState,
    ) -> Result<Self, NotAFailureState> {
        if !exec_state.is_failure() {
            return Err(NotAFailureState(exec_state));
        }
        Ok(Self {
            message: message.into(),
            exec_state,
            unexpected_error: None,
            params: Map::new(),
        })
    }

    /// # Panics
    ///
    /// Panics when `exec_state` is not a failure state. That is a programming
    /// error, not a runtime condition.
    pub fn new(message: impl Into<String>, exec_state: ExecutionState) -> Self {
        match Self::try_new(message, exec_state) {
            Ok(err) => err,
            Err(e) => panic!("{e}"),
        }
    }

    pub fn start_failed(message: impl Into<String>) -> Self {
        Self::new(message, ExecutionState::StartFailed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(message, ExecutionState::Failed)
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(message, ExecutionState::Interrupted)
    }

    /// Wraps an unclassified failure into `ERROR`.
    pub fn from_unexpected(cause: impl fmt::Display) -> Self {
        let mut err = Self::new("Unexpected error", ExecutionState::Error);
        err.unexpected_error = Some(cause.to_string());
        err
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_failure_state() {
        assert_eq!(
            ExecutionError::try_new("x", ExecutionState::Completed),
            Err(NotAFailureState(ExecutionState::Completed))
        );
    }

    #[test]
    #[should_panic(expected = "exec_state must be a failure")]
    fn new_fails_fast() {
        ExecutionError::new("x", ExecutionState::Running);
    }

    #[test]
    fn unexpected_maps_to_error_state() {
        let err = ExecutionError::from_unexpected("boom");
        assert_eq!(err.exec_state, ExecutionState::Error);
        assert_eq!(err.unexpected_error.as_deref(), Some("boom"));
        assert_eq!(err.to_string(), "Unexpected error");
    }

    #[test]
    fn params_survive_json() {
        let err = ExecutionError::failed("Process returned non-zero code 3").with_param("exit_code", 3);
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ExecutionError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, err);
        assert_eq!(parsed.params["exit_code"], 3);
    }

    #[test]
    fn deserialize_rejects_non_failure_state() {
        let json = r#"{"message":"m","exec_state":"COMPLETED"}"#;
        assert!(serde_json::from_str::<ExecutionError>(json).is_err());
    }
}
