//! Evidence persistence.
//!
//! File layout inside a session directory:
//!
//! ```text
//! <state_dir>/<session_id>/
//!   evidence/<evidence_id>.json
//!   raw_logs/<name>.log
//!   evidence_index.json
//!   evidence_index.sha256
//!   evidence_summary.json
//! ```

use super::item::EvidenceItem;
use super::ledger::EvidenceSummary;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::session::store::{validate_session_id, write_atomic};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const EVIDENCE_DIR: &str = "evidence";
pub const RAW_LOG_DIR: &str = "raw_logs";
pub const INDEX_FILE: &str = "evidence_index.json";
pub const SEAL_FILE: &str = "evidence_index.sha256";
pub const SUMMARY_FILE: &str = "evidence_summary.json";

/// Repository for evidence items, raw logs and the sealed index.
pub trait EvidenceStore: Send + Sync {
    fn init_session(&self, session_id: &str) -> CoreResult<()>;
    /// Write an item. Items are write-once; an existing id is an error.
    fn put_item(&self, item: &EvidenceItem) -> CoreResult<()>;
    fn get_item(&self, session_id: &str, evidence_id: &str) -> CoreResult<Option<EvidenceItem>>;
    fn list_items(&self, session_id: &str) -> CoreResult<Vec<EvidenceItem>>;
    /// Store a raw execution log and return a reference to it.
    fn put_raw_log(&self, session_id: &str, name: &str, content: &str) -> CoreResult<String>;
    fn read_raw_log(&self, session_id: &str, reference: &str) -> CoreResult<Option<String>>;
    fn write_index(&self, session_id: &str, index: &[u8], seal: &str) -> CoreResult<()>;
    fn read_index(&self, session_id: &str) -> CoreResult<Option<Vec<u8>>>;
    fn read_seal(&self, session_id: &str) -> CoreResult<Option<String>>;
    fn write_summary(&self, summary: &EvidenceSummary) -> CoreResult<()>;
}

fn duplicate(item: &EvidenceItem) -> CoreError {
    CoreError::new(
        ErrorKind::DuplicateEvidence,
        format!("evidence {} already recorded", item.evidence_id),
    )
    .with_detail("evidence_id", &item.evidence_id)
    .with_detail("session_id", &item.session_id)
}

/// Keep raw log names to a safe file stem.
fn log_file_name(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.log", stem.trim_matches('.'))
}

#[derive(Debug, Clone)]
pub struct FileEvidenceStore {
    root: PathBuf,
}

impl FileEvidenceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn index_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(INDEX_FILE)
    }

    fn item_path(&self, session_id: &str, evidence_id: &str) -> CoreResult<PathBuf> {
        validate_session_id(session_id)?;
        validate_session_id(evidence_id).map_err(|_| {
            CoreError::new(ErrorKind::EvidenceNotFound, "invalid evidence id")
                .with_detail("evidence_id", evidence_id)
        })?;
        Ok(self
            .session_dir(session_id)
            .join(EVIDENCE_DIR)
            .join(format!("{}.json", evidence_id)))
    }

    fn read_optional(path: &Path) -> CoreResult<Option<Vec<u8>>> {
        if !path.exists() {
            return Ok(None);
        }
        fs::read(path)
            .map(Some)
            .map_err(|e| CoreError::io("Failed to read evidence file", path, e))
    }
}

impl EvidenceStore for FileEvidenceStore {
    fn init_session(&self, session_id: &str) -> CoreResult<()> {
        validate_session_id(session_id)?;
        let dir = self.session_dir(session_id);
        for sub in [EVIDENCE_DIR, RAW_LOG_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path)
                .map_err(|e| CoreError::io("Failed to create evidence directory", &path, e))?;
        }
        Ok(())
    }

    fn put_item(&self, item: &EvidenceItem) -> CoreResult<()> {
        let path = self.item_path(&item.session_id, &item.evidence_id)?;
        if path.exists() {
            return Err(duplicate(item));
        }
        let json = serde_json::to_vec_pretty(item)
            .map_err(|e| CoreError::serialization("Failed to serialize evidence", e))?;
        write_atomic(&path, &json)
    }

    fn get_item(&self, session_id: &str, evidence_id: &str) -> CoreResult<Option<EvidenceItem>> {
        let path = self.item_path(session_id, evidence_id)?;
        match Self::read_optional(&path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| CoreError::serialization("Failed to parse evidence item", e)),
            None => Ok(None),
        }
    }

    fn list_items(&self, session_id: &str) -> CoreResult<Vec<EvidenceItem>> {
        let dir = self.session_dir(session_id).join(EVIDENCE_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&dir).map_err(|e| CoreError::io("Failed to list evidence", &dir, e))?;
        let mut items = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path)
                .map_err(|e| CoreError::io("Failed to read evidence item", &path, e))?;
            let item: EvidenceItem = serde_json::from_slice(&content)
                .map_err(|e| CoreError::serialization("Failed to parse evidence item", e))?;
            items.push(item);
        }
        items.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.evidence_id.cmp(&b.evidence_id))
        });
        Ok(items)
    }

    fn put_raw_log(&self, session_id: &str, name: &str, content: &str) -> CoreResult<String> {
        validate_session_id(session_id)?;
        let file_name = log_file_name(name);
        let dir = self.session_dir(session_id).join(RAW_LOG_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| CoreError::io("Failed to create raw log directory", &dir, e))?;
        let path = dir.join(&file_name);
        fs::write(&path, content).map_err(|e| CoreError::io("Failed to write raw log", &path, e))?;
        Ok(format!("{}/{}", RAW_LOG_DIR, file_name))
    }

    fn read_raw_log(&self, session_id: &str, reference: &str) -> CoreResult<Option<String>> {
        let Some(name) = reference.strip_prefix(&format!("{}/", RAW_LOG_DIR)) else {
            return Ok(None);
        };
        let path = self
            .session_dir(session_id)
            .join(RAW_LOG_DIR)
            .join(log_file_name(name.trim_end_matches(".log")));
        match Self::read_optional(&path)? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    fn write_index(&self, session_id: &str, index: &[u8], seal: &str) -> CoreResult<()> {
        let dir = self.session_dir(session_id);
        write_atomic(&dir.join(INDEX_FILE), index)?;
        let seal_line = format!("{}  {}\n", seal, INDEX_FILE);
        write_atomic(&dir.join(SEAL_FILE), seal_line.as_bytes())
    }

    fn read_index(&self, session_id: &str) -> CoreResult<Option<Vec<u8>>> {
        Self::read_optional(&self.index_path(session_id))
    }

    fn read_seal(&self, session_id: &str) -> CoreResult<Option<String>> {
        let path = self.session_dir(session_id).join(SEAL_FILE);
        Ok(Self::read_optional(&path)?.and_then(|bytes| {
            String::from_utf8_lossy(&bytes)
                .split_whitespace()
                .next()
                .map(str::to_string)
        }))
    }

    fn write_summary(&self, summary: &EvidenceSummary) -> CoreResult<()> {
        let path = self.session_dir(&summary.session_id).join(SUMMARY_FILE);
        let json = serde_json::to_vec_pretty(summary)
            .map_err(|e| CoreError::serialization("Failed to serialize evidence summary", e))?;
        write_atomic(&path, &json)
    }
}

#[derive(Debug, Default)]
struct MemorySession {
    items: BTreeMap<String, EvidenceItem>,
    raw_logs: BTreeMap<String, String>,
    index: Option<(Vec<u8>, String)>,
    summary: Option<String>,
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryEvidenceStore {
    sessions: Mutex<HashMap<String, MemorySession>>,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut MemorySession) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| CoreError::poisoned("evidence store"))?;
        f(sessions.entry(session_id.to_string()).or_default())
    }

    /// Overwrite the stored index without resealing, as an outside editor would.
    pub fn tamper_index(&self, session_id: &str, bytes: &[u8]) -> CoreResult<()> {
        self.with_session(session_id, |s| {
            if let Some((index, _)) = s.index.as_mut() {
                *index = bytes.to_vec();
            }
            Ok(())
        })
    }

    /// Replace a stored item in place, bypassing write-once.
    pub fn tamper_item(&self, item: &EvidenceItem) -> CoreResult<()> {
        self.with_session(&item.session_id, |s| {
            s.items.insert(item.evidence_id.clone(), item.clone());
            Ok(())
        })
    }

    pub fn summary(&self, session_id: &str) -> Option<String> {
        self.with_session(session_id, |s| Ok(s.summary.clone()))
            .ok()
            .flatten()
    }
}

impl EvidenceStore for MemoryEvidenceStore {
    fn init_session(&self, session_id: &str) -> CoreResult<()> {
        self.with_session(session_id, |_| Ok(()))
    }

    fn put_item(&self, item: &EvidenceItem) -> CoreResult<()> {
        self.with_session(&item.session_id, |s| {
            if s.items.contains_key(&item.evidence_id) {
                return Err(duplicate(item));
            }
            s.items.insert(item.evidence_id.clone(), item.clone());
            Ok(())
        })
    }

    fn get_item(&self, session_id: &str, evidence_id: &str) -> CoreResult<Option<EvidenceItem>> {
        self.with_session(session_id, |s| Ok(s.items.get(evidence_id).cloned()))
    }

    fn list_items(&self, session_id: &str) -> CoreResult<Vec<EvidenceItem>> {
        self.with_session(session_id, |s| {
            let mut items: Vec<EvidenceItem> = s.items.values().cloned().collect();
            items.sort_by(|a, b| {
                a.recorded_at
                    .cmp(&b.recorded_at)
                    .then_with(|| a.evidence_id.cmp(&b.evidence_id))
            });
            Ok(items)
        })
    }

    fn put_raw_log(&self, session_id: &str, name: &str, content: &str) -> CoreResult<String> {
        let reference = format!("{}/{}", RAW_LOG_DIR, log_file_name(name));
        self.with_session(session_id, |s| {
            s.raw_logs.insert(reference.clone(), content.to_string());
            Ok(reference.clone())
        })
    }

    fn read_raw_log(&self, session_id: &str, reference: &str) -> CoreResult<Option<String>> {
        self.with_session(session_id, |s| Ok(s.raw_logs.get(reference).cloned()))
    }

    fn write_index(&self, session_id: &str, index: &[u8], seal: &str) -> CoreResult<()> {
        self.with_session(session_id, |s| {
            s.index = Some((index.to_vec(), seal.to_string()));
            Ok(())
        })
    }

    fn read_index(&self, session_id: &str) -> CoreResult<Option<Vec<u8>>> {
        self.with_session(session_id, |s| Ok(s.index.as_ref().map(|(i, _)| i.clone())))
    }

    fn read_seal(&self, session_id: &str) -> CoreResult<Option<String>> {
        self.with_session(session_id, |s| Ok(s.index.as_ref().map(|(_, h)| h.clone())))
    }

    fn write_summary(&self, summary: &EvidenceSummary) -> CoreResult<()> {
        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| CoreError::serialization("Failed to serialize evidence summary", e))?;
        self.with_session(&summary.session_id, |s| {
            s.summary = Some(json);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::item::Artifact;
    use tempfile::tempdir;

    fn item(session: &str) -> EvidenceItem {
        EvidenceItem::new(session, "op-1", "file_write", vec![Artifact::new("a.rs", "x")])
    }

    #[test]
    fn test_file_store_layout() {
        let dir = tempdir().unwrap();
        let store = FileEvidenceStore::new(dir.path());
        store.init_session("s1").unwrap();
        assert!(dir.path().join("s1").join(EVIDENCE_DIR).is_dir());
        assert!(dir.path().join("s1").join(RAW_LOG_DIR).is_dir());

        let item = item("s1");
        store.put_item(&item).unwrap();
        let path = dir
            .path()
            .join("s1")
            .join(EVIDENCE_DIR)
            .join(format!("{}.json", item.evidence_id));
        assert!(path.exists());
        assert_eq!(store.get_item("s1", &item.evidence_id).unwrap(), Some(item.clone()));
        assert_eq!(store.list_items("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_file_store_items_are_write_once() {
        let dir = tempdir().unwrap();
        let store = FileEvidenceStore::new(dir.path());
        store.init_session("s1").unwrap();
        let item = item("s1");
        store.put_item(&item).unwrap();
        let err = store.put_item(&item).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateEvidence);
    }

    #[test]
    fn test_raw_log_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileEvidenceStore::new(dir.path());
        store.init_session("s1").unwrap();
        let reference = store
            .put_raw_log("s1", "task-1/attempt 1", "stdout text")
            .unwrap();
        assert_eq!(reference, "raw_logs/task-1_attempt_1.log");
        assert_eq!(
            store.read_raw_log("s1", &reference).unwrap().as_deref(),
            Some("stdout text")
        );
    }

    #[test]
    fn test_seal_file_format() {
        let dir = tempdir().unwrap();
        let store = FileEvidenceStore::new(dir.path());
        store.init_session("s1").unwrap();
        store.write_index("s1", b"{}", "abc123").unwrap();
        let raw = fs::read_to_string(dir.path().join("s1").join(SEAL_FILE)).unwrap();
        assert_eq!(raw, "abc123  evidence_index.json\n");
        assert_eq!(store.read_seal("s1").unwrap().as_deref(), Some("abc123"));
        assert_eq!(store.read_index("s1").unwrap().unwrap(), b"{}".to_vec());
    }

    #[test]
    fn test_memory_store_write_once() {
        let store = MemoryEvidenceStore::new();
        let item = item("m1");
        store.put_item(&item).unwrap();
        assert!(store.put_item(&item).is_err());
        assert_eq!(store.list_items("m1").unwrap().len(), 1);
    }
}
