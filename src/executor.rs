//! The code-generation executor collaborator.
//!
//! The core submits a task description and gets back the output and the list
//! of files the executor touched. How the executor runs (subprocess, API call)
//! is its own business.
//!
//! Real implementations live outside this crate. [`ScriptedExecutor`] replays
//! canned responses for tests and dry runs.

use crate::errors::{CoreError, CoreResult, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRequest {
    pub session_id: String,
    pub task_id: String,
    pub worker_id: String,
    /// 1-based attempt number for this task.
    pub attempt: u32,
    pub prompt: String,
    /// Set on retries after a REJECT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_instruction: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorResponse {
    pub output: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    pub status: ExecutorStatus,
}

impl ExecutorResponse {
    pub fn success(output: impl Into<String>, files_modified: Vec<String>) -> Self {
        Self {
            output: output.into(),
            files_modified,
            status: ExecutorStatus::Success,
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&self, request: ExecutorRequest) -> CoreResult<ExecutorResponse>;
}

/// One scripted step: files to write into the workspace, then the reply.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond {
        writes: Vec<(String, String)>,
        response: ExecutorResponse,
    },
    Fail(String),
}

/// Replays a fixed script of responses in order.
///
/// `Respond` steps write their files under the workspace root before replying,
/// so the reply's `files_modified` points at real content.
pub struct ScriptedExecutor {
    workspace: std::path::PathBuf,
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ExecutorRequest>>,
}

impl ScriptedExecutor {
    pub fn new(workspace: impl Into<std::path::PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then_write(self, files: &[(&str, &str)], output: &str) -> Self {
        let writes: Vec<(String, String)> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        let modified = writes.iter().map(|(p, _)| p.clone()).collect();
        self.push(ScriptStep::Respond {
            writes,
            response: ExecutorResponse::success(output, modified),
        })
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.push(ScriptStep::Fail(message.to_string()))
    }

    fn push(self, step: ScriptStep) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ExecutorRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn submit(&self, request: ExecutorRequest) -> CoreResult<ExecutorResponse> {
        let step = {
            let mut steps = self
                .steps
                .lock()
                .map_err(|_| CoreError::poisoned("scripted executor"))?;
            steps.pop_front()
        };
        self.requests
            .lock()
            .map_err(|_| CoreError::poisoned("scripted executor"))?
            .push(request.clone());

        match step {
            None => Err(CoreError::new(
                ErrorKind::ExecutorFailure,
                format!("script exhausted at task {} attempt {}", request.task_id, request.attempt),
            )),
            Some(ScriptStep::Fail(message)) => Err(CoreError::new(ErrorKind::ExecutorFailure, message)
                .with_detail("task_id", &request.task_id)),
            Some(ScriptStep::Respond { writes, response }) => {
                for (path, content) in writes {
                    let full = self.workspace.join(&path);
                    if let Some(parent) = full.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| CoreError::io("Failed to create directory", parent, e))?;
                    }
                    tokio::fs::write(&full, content)
                        .await
                        .map_err(|e| CoreError::io("Failed to write file", &full, e))?;
                }
                Ok(response)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(attempt: u32) -> ExecutorRequest {
        ExecutorRequest {
            session_id: "s1".to_string(),
            task_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            attempt,
            prompt: "write a".to_string(),
            modification_instruction: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptedExecutor::new(dir.path())
            .then_fail("connection reset")
            .then_write(&[("src/a.rs", "fn a() {}")], "wrote a");

        let err = executor.submit(request(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutorFailure);

        let response = executor.submit(request(2)).await.unwrap();
        assert_eq!(response.status, ExecutorStatus::Success);
        assert_eq!(response.files_modified, vec!["src/a.rs".to_string()]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/a.rs")).unwrap(),
            "fn a() {}"
        );

        assert!(executor.submit(request(3)).await.is_err());
        assert_eq!(executor.requests().len(), 3);
    }
}
