//! Conversation tracer sink.
//!
//! The orchestrator reports each exchange with the executor as it happens.
//! Sinks own their storage and are never read back by the core.

use crate::errors::{CoreError, CoreResult};
use crate::executor::{ExecutorRequest, ExecutorResponse};
use crate::lifecycle::FinalReport;
use crate::review::Judgment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const CONVERSATION_FILE: &str = "conversation.jsonl";

pub trait ConversationTracer: Send + Sync {
    fn user_request(&self, session_id: &str, task_id: &str, prompt: &str) -> CoreResult<()>;
    fn executor_request(&self, request: &ExecutorRequest) -> CoreResult<()>;
    fn executor_response(&self, session_id: &str, task_id: &str, response: &ExecutorResponse) -> CoreResult<()>;
    fn quality_judgment(&self, session_id: &str, judgment: &Judgment) -> CoreResult<()>;
    fn rejection_detail(&self, session_id: &str, task_id: &str, instruction: &str) -> CoreResult<()>;
    fn final_summary(&self, report: &FinalReport) -> CoreResult<()>;
}

/// Discards every event.
pub struct NullTracer;

impl ConversationTracer for NullTracer {
    fn user_request(&self, _: &str, _: &str, _: &str) -> CoreResult<()> {
        Ok(())
    }
    fn executor_request(&self, _: &ExecutorRequest) -> CoreResult<()> {
        Ok(())
    }
    fn executor_response(&self, _: &str, _: &str, _: &ExecutorResponse) -> CoreResult<()> {
        Ok(())
    }
    fn quality_judgment(&self, _: &str, _: &Judgment) -> CoreResult<()> {
        Ok(())
    }
    fn rejection_detail(&self, _: &str, _: &str, _: &str) -> CoreResult<()> {
        Ok(())
    }
    fn final_summary(&self, _: &FinalReport) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    UserRequest {
        session_id: String,
        task_id: String,
        prompt: String,
    },
    ExecutorRequest {
        request: ExecutorRequest,
    },
    ExecutorResponse {
        session_id: String,
        task_id: String,
        response: ExecutorResponse,
    },
    QualityJudgment {
        session_id: String,
        judgment: Judgment,
    },
    RejectionDetail {
        session_id: String,
        task_id: String,
        instruction: String,
    },
    FinalSummary {
        report: FinalReport,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// Appends one JSON line per event to `conversation.jsonl`.
pub struct JsonlTracer {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTracer {
    /// Trace into `<dir>/conversation.jsonl`, creating `dir` if needed.
    pub fn new(dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(dir).map_err(|e| CoreError::io("Failed to create trace directory", dir, e))?;
        Ok(Self {
            path: dir.join(CONVERSATION_FILE),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: TraceEvent) -> CoreResult<()> {
        let record = TraceRecord {
            timestamp: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| CoreError::serialization("Failed to serialize trace event", e))?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CoreError::poisoned("conversation tracer"))?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| CoreError::io("Failed to append trace event", &self.path, e))
    }
}

impl ConversationTracer for JsonlTracer {
    fn user_request(&self, session_id: &str, task_id: &str, prompt: &str) -> CoreResult<()> {
        self.append(TraceEvent::UserRequest {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            prompt: prompt.to_string(),
        })
    }

    fn executor_request(&self, request: &ExecutorRequest) -> CoreResult<()> {
        self.append(TraceEvent::ExecutorRequest {
            request: request.clone(),
        })
    }

    fn executor_response(&self, session_id: &str, task_id: &str, response: &ExecutorResponse) -> CoreResult<()> {
        self.append(TraceEvent::ExecutorResponse {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            response: response.clone(),
        })
    }

    fn quality_judgment(&self, session_id: &str, judgment: &Judgment) -> CoreResult<()> {
        self.append(TraceEvent::QualityJudgment {
            session_id: session_id.to_string(),
            judgment: judgment.clone(),
        })
    }

    fn rejection_detail(&self, session_id: &str, task_id: &str, instruction: &str) -> CoreResult<()> {
        self.append(TraceEvent::RejectionDetail {
            session_id: session_id.to_string(),
            task_id: task_id.to_string(),
            instruction: instruction.to_string(),
        })
    }

    fn final_summary(&self, report: &FinalReport) -> CoreResult<()> {
        self.append(TraceEvent::FinalSummary {
            report: report.clone(),
        })
    }
}
