//! Control API of a running instance, served over its `.api` socket.
//!
//! Requests are JSON objects tagged by `api`:
//!
//! | api               | fields                     | jobs entries   |
//! |-------------------|----------------------------|----------------|
//! | `/jobs`           | `instance_match`           | [`JobInfo`]    |
//! | `/jobs/stop`      | `instance_match`           | [`ControlResult`] |
//! | `/jobs/interrupt` | `instance_match`, `signal` | [`ControlResult`] |
//! | `/jobs/tail`      | `instance_match`           | [`JobTail`]    |
//!
//! Every response carries `response_metadata.code`. Requests that cannot be
//! decoded are answered with code 422 and an `error` message. An instance
//! not matching the pattern answers with an empty `jobs` list.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::execution::check_interrupt_signal;
use crate::job::{JobInfo, JobInstance};
use crate::paths;
use crate::socket::{RequestHandler, SocketClient, SocketServer};

pub const API_EXTENSION: &str = "api";

pub const CODE_OK: u16 = 200;
pub const CODE_UNPROCESSABLE: u16 = 422;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "api")]
pub enum ApiRequest {
    #[serde(rename = "/jobs")]
    Jobs {
        #[serde(default)]
        instance_match: String,
    },
    #[serde(rename = "/jobs/stop")]
    Stop { instance_match: String },
    #[serde(rename = "/jobs/interrupt")]
    Interrupt { instance_match: String, signal: i32 },
    #[serde(rename = "/jobs/tail")]
    Tail {
        #[serde(default)]
        instance_match: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub response_metadata: ResponseMetadata,
    #[serde(default = "Vec::new")]
    pub jobs: Vec<T>,
}

impl<T> ApiResponse<T> {
    fn ok(jobs: Vec<T>) -> Self {
        Self {
            response_metadata: ResponseMetadata {
                code: CODE_OK,
                error: None,
            },
            jobs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResult {
    pub job_id: String,
    pub instance_id: String,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTail {
    pub job_id: String,
    pub instance_id: String,
    pub lines: Vec<String>,
}

fn unprocessable(error: impl ToString) -> Value {
    json!({
        "response_metadata": { "code": CODE_UNPROCESSABLE, "error": error.to_string() }
    })
}

fn to_value<T: Serialize>(response: ApiResponse<T>) -> Option<Value> {
    match serde_json::to_value(response) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(error = %e, "response_encoding_failed");
            None
        }
    }
}

struct InstanceApi {
    instance: JobInstance,
}

impl InstanceApi {
    fn matching(&self, pattern: &str) -> Option<JobInfo> {
        let info = self.instance.create_info();
        info.matches(pattern).then_some(info)
    }

    fn control_result(&self, result: &str) -> ControlResult {
        ControlResult {
            job_id: self.instance.job_id().to_string(),
            instance_id: self.instance.instance_id().to_string(),
            result: result.to_string(),
        }
    }
}

impl RequestHandler for InstanceApi {
    fn handle(&self, request: Value) -> Option<Value> {
        let request: ApiRequest = match serde_json::from_value(request) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "invalid_api_request");
                return Some(unprocessable(e));
            }
        };
        tracing::debug!(?request, instance_id = %self.instance.instance_id(), "api_request");

        match request {
            ApiRequest::Jobs { instance_match } => {
                to_value(ApiResponse::ok(self.matching(&instance_match).into_iter().collect()))
            }
            ApiRequest::Stop { instance_match } => {
                let jobs = match self.matching(&instance_match) {
                    Some(_) => {
                        self.instance.stop();
                        vec![self.control_result("stop_performed")]
                    }
                    None => vec![],
                };
                to_value(ApiResponse::ok(jobs))
            }
            ApiRequest::Interrupt {
                instance_match,
                signal,
            } => {
                if let Err(e) = check_interrupt_signal(signal) {
                    return Some(unprocessable(e));
                }
                let jobs = match self.matching(&instance_match) {
                    Some(_) => match self.instance.interrupt(signal) {
                        Ok(()) => vec![self.control_result("interrupt_performed")],
                        Err(e) => return Some(unprocessable(e)),
                    },
                    None => vec![],
                };
                to_value(ApiResponse::ok(jobs))
            }
            ApiRequest::Tail { instance_match } => {
                let jobs = self
                    .matching(&instance_match)
                    .map(|info| JobTail {
                        job_id: info.job_id,
                        instance_id: info.instance_id,
                        lines: info.last_output,
                    })
                    .into_iter()
                    .collect();
                to_value(ApiResponse::ok(jobs))
            }
        }
    }

    fn handle_invalid(&self, error: &serde_json::Error) -> Option<Value> {
        Some(unprocessable(error))
    }
}

/// Serves the control API of one instance at `<dir>/<instance_id>.api`.
pub struct ApiServer {
    server: SocketServer,
}

impl ApiServer {
    pub fn start(dir: &Path, instance: JobInstance) -> Result<Self> {
        let path = paths::socket_path(dir, instance.instance_id(), API_EXTENSION);
        let server = SocketServer::start(path, Arc::new(InstanceApi { instance }))?;
        Ok(Self { server })
    }

    pub fn path(&self) -> &Path {
        self.server.path()
    }

    pub fn close(&mut self) {
        self.server.close();
    }
}

/// Queries and controls all running instances.
pub struct ApiClient {
    client: SocketClient,
}

impl ApiClient {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client: SocketClient::new(dir, API_EXTENSION, true)?,
        })
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: self.client.with_timeout(timeout)?,
        })
    }

    pub fn read_jobs_info(&mut self, instance_match: &str) -> Result<Vec<JobInfo>> {
        self.send(&ApiRequest::Jobs {
            instance_match: instance_match.to_string(),
        })
    }

    pub fn stop_jobs(&mut self, instance_match: &str) -> Result<Vec<ControlResult>> {
        self.send(&ApiRequest::Stop {
            instance_match: instance_match.to_string(),
        })
    }

    pub fn interrupt_jobs(&mut self, instance_match: &str, signal: i32) -> Result<Vec<ControlResult>> {
        check_interrupt_signal(signal)?;
        self.send(&ApiRequest::Interrupt {
            instance_match: instance_match.to_string(),
            signal,
        })
    }

    pub fn read_tail(&mut self, instance_match: &str) -> Result<Vec<JobTail>> {
        self.send(&ApiRequest::Tail {
            instance_match: instance_match.to_string(),
        })
    }

    fn send<T: DeserializeOwned>(&mut self, request: &ApiRequest) -> Result<Vec<T>> {
        let request = serde_json::to_value(request)?;
        let mut jobs = Vec::new();
        for resp in self.client.communicate(&request, &[])? {
            let decoded: ApiResponse<T> = match serde_json::from_value(resp.response) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::warn!(instance_id = %resp.instance_id, error = %e, "invalid_api_response");
                    continue;
                }
            };
            if decoded.response_metadata.code != CODE_OK {
                tracing::warn!(
                    instance_id = %resp.instance_id,
                    code = decoded.response_metadata.code,
                    error = decoded.response_metadata.error.as_deref().unwrap_or(""),
                    "api_error"
                );
                continue;
            }
            jobs.extend(decoded.jobs);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionState;
    use crate::testing::{StateWaiter, TestExecution};
    use std::thread;

    fn running(job_id: &str, instance_id: &str) -> (JobInstance, Arc<TestExecution>, thread::JoinHandle<()>) {
        let execution = Arc::new(TestExecution::blocking());
        let inst = JobInstance::new(job_id, instance_id, execution.clone());
        let waiter = StateWaiter::new();
        inst.add_state_observer(waiter.observer());
        let runner = inst.clone();
        let handle = thread::spawn(move || runner.run());
        waiter
            .wait_for_state(ExecutionState::Running, Duration::from_secs(5))
            .unwrap();
        (inst, execution, handle)
    }

    #[test]
    fn request_tags() {
        let value = serde_json::to_value(ApiRequest::Interrupt {
            instance_match: "a*".into(),
            signal: 9,
        })
        .unwrap();
        assert_eq!(value, json!({"api": "/jobs/interrupt", "instance_match": "a*", "signal": 9}));

        let parsed: ApiRequest = serde_json::from_value(json!({"api": "/jobs"})).unwrap();
        assert_eq!(parsed, ApiRequest::Jobs { instance_match: String::new() });
    }

    #[test]
    fn reads_info_and_stops_matching_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (build, _, build_handle) = running("build", "b1");
        let (deploy, deploy_exec, deploy_handle) = running("deploy", "d1");
        let _build_api = ApiServer::start(dir.path(), build.clone()).unwrap();
        let _deploy_api = ApiServer::start(dir.path(), deploy.clone()).unwrap();

        let mut client = ApiClient::new(dir.path()).unwrap();
        let jobs = client.read_jobs_info("").unwrap();
        let mut ids: Vec<_> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["build", "deploy"]);
        assert!(jobs.iter().all(|j| j.state() == ExecutionState::Running));

        let stopped = client.stop_jobs("build").unwrap();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].instance_id, "b1");
        assert_eq!(stopped[0].result, "stop_performed");
        build_handle.join().unwrap();
        assert_eq!(build.state(), ExecutionState::Stopped);
        assert_eq!(deploy.state(), ExecutionState::Running);

        deploy_exec.release();
        deploy_handle.join().unwrap();
    }

    #[test]
    fn interrupt_and_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (inst, _, handle) = running("job", "i1");
        inst.output("hello");
        let _api = ApiServer::start(dir.path(), inst.clone()).unwrap();

        let mut client = ApiClient::new(dir.path()).unwrap();
        let tail = client.read_tail("i1").unwrap();
        assert_eq!(tail[0].lines, vec!["hello"]);

        assert!(client.interrupt_jobs("*", 2).is_err());
        let interrupted = client.interrupt_jobs("*", 9).unwrap();
        assert_eq!(interrupted[0].result, "interrupt_performed");
        handle.join().unwrap();
        assert_eq!(inst.state(), ExecutionState::Interrupted);
    }

    #[test]
    fn malformed_request_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let inst = JobInstance::new("job", "m1", Arc::new(TestExecution::completing()));
        let _api = ApiServer::start(dir.path(), inst).unwrap();

        let mut client = SocketClient::new(dir.path(), API_EXTENSION, true).unwrap();
        let responses = client.communicate(&json!({"api": "/nope"}), &[]).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response["response_metadata"]["code"], 422);
        assert!(responses[0].response["response_metadata"]["error"].is_string());
    }

    #[test]
    fn unmatched_instance_answers_empty() {
        let inst = JobInstance::new("job", "u1", Arc::new(TestExecution::completing()));
        let api = InstanceApi { instance: inst };
        let response = api.handle(json!({"api": "/jobs", "instance_match": "other"})).unwrap();
        assert_eq!(response["response_metadata"]["code"], 200);
        assert_eq!(response["jobs"], json!([]));

        let err = serde_json::from_slice::<Value>(b"{oops").unwrap_err();
        let response = api.handle_invalid(&err).unwrap();
        assert_eq!(response["response_metadata"]["code"], 422);
    }
}
