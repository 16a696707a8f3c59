//! Session persistence.
//!
//! Layout of one session directory:
//!
//! ```text
//! <state_dir>/<session_id>/
//!   session.json          current snapshot, rewritten on every save
//!   executor_runs.jsonl   append-only log of worker invocations
//!   report.json           final summary
//!   .owner.lock           advisory lock held by the owning process
//! ```

use super::Session;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::lifecycle::FinalReport;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SESSION_FILE: &str = "session.json";
pub const EXECUTOR_RUNS_FILE: &str = "executor_runs.jsonl";
pub const REPORT_FILE: &str = "report.json";
const OWNER_LOCK_FILE: &str = ".owner.lock";

/// One line of `executor_runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorRun {
    pub run_id: String,
    pub session_id: String,
    pub task_id: String,
    pub worker_id: String,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub output_chars: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Repository for sessions, their run log and their final report.
pub trait SessionStore: Send + Sync {
    fn save(&self, session: &Session) -> CoreResult<()>;
    fn load(&self, session_id: &str) -> CoreResult<Option<Session>>;
    fn exists(&self, session_id: &str) -> bool;
    fn list(&self) -> CoreResult<Vec<String>>;
    fn append_executor_run(&self, run: &ExecutorRun) -> CoreResult<()>;
    fn executor_runs(&self, session_id: &str) -> CoreResult<Vec<ExecutorRun>>;
    /// Persist the final report and return where it was written.
    fn write_report(&self, report: &FinalReport) -> CoreResult<String>;
}

/// Session ids become directory names; reject anything that could escape the state dir.
pub fn validate_session_id(session_id: &str) -> CoreResult<()> {
    let valid = !session_id.is_empty()
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && session_id != "."
        && session_id != "..";
    if valid {
        Ok(())
    } else {
        Err(
            CoreError::new(ErrorKind::Configuration, "invalid session id")
                .with_detail("session_id", session_id),
        )
    }
}

/// File-backed store rooted at the configured state directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn ensure_dir(&self, session_id: &str) -> CoreResult<PathBuf> {
        validate_session_id(session_id)?;
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)
            .map_err(|e| CoreError::io("Failed to create session directory", &dir, e))?;
        Ok(dir)
    }

    /// Take the advisory ownership lock for a session directory.
    ///
    /// Fails if another process already owns the session. The lock is held
    /// until the returned guard is dropped.
    pub fn acquire_exclusive(&self, session_id: &str) -> CoreResult<SessionGuard> {
        let dir = self.ensure_dir(session_id)?;
        let path = dir.join(OWNER_LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| CoreError::io("Failed to open session owner lock", &path, e))?;
        file.try_lock_exclusive().map_err(|_| {
            CoreError::new(
                ErrorKind::Configuration,
                format!("session {} is owned by another process", session_id),
            )
            .with_detail("session_id", session_id)
            .with_detail("lock_file", path.display().to_string())
        })?;
        Ok(SessionGuard { file, path })
    }
}

/// Holds the session ownership lock; released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    file: fs::File,
    path: PathBuf,
}

impl SessionGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write via a sibling temp file and rename so readers never see a torn file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| CoreError::io("Failed to write temp file", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::io("Failed to replace file", path, e))
}

impl SessionStore for FileSessionStore {
    fn save(&self, session: &Session) -> CoreResult<()> {
        let dir = self.ensure_dir(&session.session_id)?;
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| CoreError::serialization("Failed to serialize session", e))?;
        write_atomic(&dir.join(SESSION_FILE), &json)
    }

    fn load(&self, session_id: &str) -> CoreResult<Option<Session>> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(SESSION_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| CoreError::io("Failed to read session file", &path, e))?;
        let session = serde_json::from_str(&content)
            .map_err(|e| CoreError::serialization("Failed to parse session file", e))?;
        Ok(Some(session))
    }

    fn exists(&self, session_id: &str) -> bool {
        self.session_dir(session_id).join(SESSION_FILE).exists()
    }

    fn list(&self) -> CoreResult<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root)
            .map_err(|e| CoreError::io("Failed to list sessions", &self.root, e))?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(SESSION_FILE).exists())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn append_executor_run(&self, run: &ExecutorRun) -> CoreResult<()> {
        let dir = self.ensure_dir(&run.session_id)?;
        let path = dir.join(EXECUTOR_RUNS_FILE);
        let mut line = serde_json::to_string(run)
            .map_err(|e| CoreError::serialization("Failed to serialize executor run", e))?;
        line.push('\n');
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .map_err(|e| CoreError::io("Failed to append executor run", &path, e))
    }

    fn executor_runs(&self, session_id: &str) -> CoreResult<Vec<ExecutorRun>> {
        validate_session_id(session_id)?;
        let path = self.session_dir(session_id).join(EXECUTOR_RUNS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| CoreError::io("Failed to read executor runs", &path, e))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| CoreError::serialization("Failed to parse executor run", e))
            })
            .collect()
    }

    fn write_report(&self, report: &FinalReport) -> CoreResult<String> {
        let dir = self.ensure_dir(&report.session_id)?;
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| CoreError::serialization("Failed to serialize report", e))?;
        write_atomic(&path, &json)?;
        Ok(path.display().to_string())
    }
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, String>>,
    runs: Mutex<HashMap<String, Vec<ExecutorRun>>>,
    reports: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, session_id: &str) -> Option<String> {
        self.reports.lock().ok()?.get(session_id).cloned()
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &Session) -> CoreResult<()> {
        let json = serde_json::to_string(session)
            .map_err(|e| CoreError::serialization("Failed to serialize session", e))?;
        self.sessions
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?
            .insert(session.session_id.clone(), json);
        Ok(())
    }

    fn load(&self, session_id: &str) -> CoreResult<Option<Session>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?;
        sessions
            .get(session_id)
            .map(|json| {
                serde_json::from_str(json)
                    .map_err(|e| CoreError::serialization("Failed to parse session", e))
            })
            .transpose()
    }

    fn exists(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false)
    }

    fn list(&self) -> CoreResult<Vec<String>> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?;
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn append_executor_run(&self, run: &ExecutorRun) -> CoreResult<()> {
        self.runs
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?
            .entry(run.session_id.clone())
            .or_default()
            .push(run.clone());
        Ok(())
    }

    fn executor_runs(&self, session_id: &str) -> CoreResult<Vec<ExecutorRun>> {
        Ok(self
            .runs
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn write_report(&self, report: &FinalReport) -> CoreResult<String> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| CoreError::serialization("Failed to serialize report", e))?;
        self.reports
            .lock()
            .map_err(|_| CoreError::poisoned("session store"))?
            .insert(report.session_id.clone(), json);
        Ok(format!("memory://{}/{}", report.session_id, REPORT_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use tempfile::tempdir;

    fn make_run(session_id: &str, attempt: u32) -> ExecutorRun {
        ExecutorRun {
            run_id: format!("run-{attempt}"),
            session_id: session_id.to_string(),
            task_id: "t1".to_string(),
            worker_id: "w1".to_string(),
            attempt,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            status: "completed".to_string(),
            files_modified: vec!["src/a.rs".to_string()],
            output_chars: 42,
            error: None,
        }
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
        assert!(!store.exists("nope"));
    }

    #[test]
    fn test_save_and_reload_after_restart() {
        let dir = tempdir().unwrap();
        {
            let store = FileSessionStore::new(dir.path());
            let mut session = Session::new("s1");
            session.push_completed(Phase::RequirementAnalysis);
            session.set_current_phase(Phase::TaskDecomposition);
            store.save(&session).unwrap();
        }
        {
            let store = FileSessionStore::new(dir.path());
            let session = store.load("s1").unwrap().unwrap();
            assert_eq!(session.current_phase(), Phase::TaskDecomposition);
            assert_eq!(store.list().unwrap(), vec!["s1".to_string()]);
        }
    }

    #[test]
    fn test_executor_runs_append_only() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.append_executor_run(&make_run("s1", 1)).unwrap();
        store.append_executor_run(&make_run("s1", 2)).unwrap();
        let runs = store.executor_runs("s1").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].attempt, 1);
        assert_eq!(runs[1].attempt, 2);
        let raw = fs::read_to_string(dir.path().join("s1").join(EXECUTOR_RUNS_FILE)).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_rejects_path_like_session_ids() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let err = store.save(&Session::new("../escape")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("ok-id_1.2").is_ok());
    }

    #[test]
    fn test_exclusive_guard_blocks_second_owner() {
        let dir = tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let guard = store.acquire_exclusive("s1").unwrap();
        assert!(store.acquire_exclusive("s1").is_err());
        drop(guard);
        assert!(store.acquire_exclusive("s1").is_ok());
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemorySessionStore::new();
        store.save(&Session::new("m1")).unwrap();
        assert!(store.exists("m1"));
        assert_eq!(
            store.load("m1").unwrap().unwrap().current_phase(),
            Phase::RequirementAnalysis
        );
        store.append_executor_run(&make_run("m1", 1)).unwrap();
        assert_eq!(store.executor_runs("m1").unwrap().len(), 1);
    }
}
