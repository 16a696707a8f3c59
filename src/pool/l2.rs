//! L2 pool: read-write workers holding file locks.
//!
//! Acquiring a slot takes a write permit from the lock manager and every
//! requested lock in one step. Releasing a slot always returns all of it.

use super::{PoolEvent, PoolLevel, Permissions, SlotHealthReport, SlotTable, SlotTask, SlotTaskStatus, WorkerSlot};
use crate::config::PhasegateConfig;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::evidence::{EvidenceItem, EvidenceLedger};
use crate::locks::{LockKind, LockManager};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What an L2 worker asks for when it takes a slot.
#[derive(Debug, Clone, Default)]
pub struct L2Request {
    pub worker_id: String,
    /// Files to write-lock for the lifetime of the slot.
    pub lock_paths: Vec<String>,
    /// Glob patterns the slot may write. Empty means any path.
    pub write_scope: Vec<String>,
}

impl L2Request {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_locks<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_write_scope<I, S>(mut self, globs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write_scope.extend(globs.into_iter().map(Into::into));
        self
    }
}

pub struct WritePool {
    table: SlotTable,
    locks: Arc<Mutex<LockManager>>,
    ledger: Option<Arc<Mutex<EvidenceLedger>>>,
}

impl WritePool {
    pub fn new(capacity: usize, stale_after: Duration, locks: Arc<Mutex<LockManager>>) -> Self {
        Self {
            table: SlotTable::new(PoolLevel::L2, capacity, stale_after),
            locks,
            ledger: None,
        }
    }

    pub fn from_config(config: &PhasegateConfig, locks: Arc<Mutex<LockManager>>) -> Self {
        Self::new(config.pools.l2_capacity, config.stale_after(), locks)
    }

    /// Record evidence of completed tasks in this ledger.
    pub fn with_ledger(mut self, ledger: Arc<Mutex<EvidenceLedger>>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PoolEvent>) -> Self {
        self.set_event_channel(tx);
        self
    }

    pub fn set_event_channel(&mut self, tx: mpsc::Sender<PoolEvent>) {
        self.table.set_event_channel(tx);
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    pub fn active_count(&self) -> usize {
        self.table.active_count()
    }

    pub fn slot(&self, slot_id: &str) -> Option<&WorkerSlot> {
        self.table.slot(slot_id)
    }

    pub fn slots(&self) -> Vec<WorkerSlot> {
        self.table.slots().cloned().collect()
    }

    pub fn lock_manager(&self) -> Arc<Mutex<LockManager>> {
        Arc::clone(&self.locks)
    }

    fn with_locks<T>(&self, f: impl FnOnce(&mut LockManager) -> T) -> CoreResult<T> {
        let mut manager = self
            .locks
            .lock()
            .map_err(|_| CoreError::poisoned("lock manager"))?;
        Ok(f(&mut manager))
    }

    /// Take a slot with a write permit and every requested lock, or nothing.
    pub fn acquire(&mut self, request: L2Request) -> CoreResult<WorkerSlot> {
        let worker_id = request.worker_id.as_str();
        if self.table.is_full() {
            warn!(worker = worker_id, capacity = self.capacity(), "L2 pool full");
            return Err(self.table.capacity_error(worker_id));
        }
        if self.table.slot_for_worker(worker_id).is_some() {
            // let the table produce the one-slot-per-worker error
            return self
                .table
                .insert(worker_id, Permissions::read_write(), Vec::new(), Vec::new());
        }
        for pattern in &request.write_scope {
            glob::Pattern::new(pattern).map_err(|e| {
                CoreError::new(
                    ErrorKind::Configuration,
                    format!("invalid write scope pattern '{}': {}", pattern, e),
                )
                .with_detail("pattern", pattern)
            })?;
        }

        let granted = self.with_locks(|manager| -> CoreResult<_> {
            let was_registered = manager.is_write_worker(worker_id);
            manager.register_write_worker(worker_id)?;
            match manager.acquire_multiple_locks(&request.lock_paths, worker_id, LockKind::Write) {
                Ok(locks) => Ok(locks),
                Err(err) => {
                    if !was_registered {
                        manager.unregister_write_worker(worker_id);
                    }
                    Err(err)
                }
            }
        })??;

        let lock_count = granted.len();
        match self
            .table
            .insert(worker_id, Permissions::read_write(), request.write_scope, granted)
        {
            Ok(slot) => {
                debug!(worker = worker_id, slot = %slot.slot_id, locks = lock_count, "L2 slot acquired");
                Ok(slot)
            }
            Err(err) => {
                self.with_locks(|manager| manager.release_all(worker_id))?;
                Err(err)
            }
        }
    }

    /// Whether the slot may write `path`.
    pub fn can_write(&self, slot_id: &str, path: &str) -> bool {
        self.check_write(slot_id, path).is_ok()
    }

    pub fn check_write(&self, slot_id: &str, path: &str) -> CoreResult<()> {
        let slot = self.table.get(slot_id)?;
        let denied = |reason: &str| {
            CoreError::new(
                ErrorKind::PermissionDenied,
                format!("slot {} may not write {}: {}", slot.slot_id, path, reason),
            )
            .with_detail("slot_id", &slot.slot_id)
            .with_detail("path", path)
            .with_detail("write_scope", &slot.write_scope)
        };
        if !slot.permissions.write {
            return Err(denied("slot has no write permission"));
        }
        if slot.write_scope.is_empty() {
            return Ok(());
        }
        let in_scope = slot.write_scope.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(path))
                .unwrap_or(false)
        });
        if in_scope {
            Ok(())
        } else {
            Err(denied("outside write scope"))
        }
    }

    pub fn assign_task(&mut self, slot_id: &str, task_id: &str) -> CoreResult<()> {
        self.table.assign_task(slot_id, task_id)
    }

    pub fn update_task_status(&mut self, slot_id: &str, status: SlotTaskStatus) -> CoreResult<()> {
        self.table.update_task_status(slot_id, status)
    }

    /// Finish the slot's task. Completion requires evidence, which is written
    /// to the ledger when one is attached.
    pub fn complete_task(
        &mut self,
        slot_id: &str,
        status: SlotTaskStatus,
        evidence: Option<EvidenceItem>,
    ) -> CoreResult<SlotTask> {
        let evidence_id = match (evidence, &self.ledger) {
            (Some(item), Some(ledger)) => Some(
                ledger
                    .lock()
                    .map_err(|_| CoreError::poisoned("evidence ledger"))?
                    .record_evidence(item)?,
            ),
            (Some(item), None) => Some(item.evidence_id),
            (None, _) => None,
        };
        self.table.complete_task(slot_id, status, evidence_id)
    }

    /// Release a slot and every lock it holds. A task still in progress blocks
    /// the release unless `force` is set.
    pub fn release(&mut self, slot_id: &str, force: bool) -> CoreResult<WorkerSlot> {
        let slot = self.table.get(slot_id)?;
        if !force && slot.has_task_in_progress() {
            let task_id = slot.task.as_ref().map(|t| t.task_id.clone());
            return Err(CoreError::new(
                ErrorKind::TaskInProgress,
                format!("slot {} still has a task in progress", slot_id),
            )
            .with_detail("slot_id", slot_id)
            .with_detail("task_id", task_id));
        }
        let worker_id = slot.worker_id.clone();
        let released = self.with_locks(|manager| manager.release_all(&worker_id))?;
        self.table.remove(slot_id, force, released.len())
    }

    pub fn health_check(&self, now: DateTime<Utc>) -> Vec<SlotHealthReport> {
        self.table.health_check(now)
    }

    /// Force-release every stale slot along with its locks.
    pub fn cleanup_stale(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<WorkerSlot>> {
        let mut released = Vec::new();
        for slot_id in self.table.stale_slots(now) {
            released.push(self.release(&slot_id, true)?);
        }
        if !released.is_empty() {
            info!(count = released.len(), "stale L2 slots released");
        }
        Ok(released)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, slot_id: &str, by: chrono::Duration) {
        self.table.backdate(slot_id, by);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{Artifact, MemoryEvidenceStore};
    use serde_json::json;

    fn locks() -> Arc<Mutex<LockManager>> {
        Arc::new(Mutex::new(LockManager::new(4, Duration::from_secs(600))))
    }

    fn pool() -> WritePool {
        WritePool::from_config(&PhasegateConfig::default(), locks())
    }

    #[test]
    fn test_fifth_acquisition_exceeds_capacity() {
        let mut p = pool();
        for i in 0..4 {
            p.acquire(L2Request::new(format!("w{i}"))).unwrap();
        }
        let err = p.acquire(L2Request::new("w4")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(err.detail("capacity"), Some(&json!(4)));
        assert_eq!(err.detail("active"), Some(&json!(4)));
    }

    #[test]
    fn test_acquire_takes_locks_and_permit() {
        let mut p = pool();
        let slot = p
            .acquire(L2Request::new("w1").with_locks(["src/b.rs", "src/a.rs"]))
            .unwrap();
        assert_eq!(slot.locks.len(), 2);
        assert_eq!(slot.locks[0].path, "src/a.rs");
        let manager = p.lock_manager();
        let manager = manager.lock().unwrap();
        assert!(manager.is_write_worker("w1"));
        assert_eq!(manager.locks_held_by("w1").len(), 2);
    }

    #[test]
    fn test_lock_conflict_leaves_nothing_behind() {
        let mut p = pool();
        p.acquire(L2Request::new("w1").with_locks(["src/shared.rs"]))
            .unwrap();
        let err = p
            .acquire(L2Request::new("w2").with_locks(["src/a.rs", "src/shared.rs"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(p.active_count(), 1);
        let manager = p.lock_manager();
        let manager = manager.lock().unwrap();
        assert!(manager.locks_on("src/a.rs").is_empty());
        assert!(!manager.is_write_worker("w2"));
    }

    #[test]
    fn test_semaphore_shared_with_lock_manager() {
        let shared = locks();
        {
            let mut m = shared.lock().unwrap();
            for i in 0..4 {
                m.register_write_worker(&format!("outside-{i}")).unwrap();
            }
        }
        let mut p = WritePool::from_config(&PhasegateConfig::default(), Arc::clone(&shared));
        let err = p.acquire(L2Request::new("w1")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SemaphoreExhausted);
        assert_eq!(p.active_count(), 0);
    }

    #[test]
    fn test_write_scope_enforced() {
        let mut p = pool();
        let slot = p
            .acquire(L2Request::new("w1").with_write_scope(["src/**/*.rs"]))
            .unwrap();
        assert!(p.can_write(&slot.slot_id, "src/pool/l2.rs"));
        let err = p.check_write(&slot.slot_id, "Cargo.toml").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let open = p.acquire(L2Request::new("w2")).unwrap();
        assert!(p.can_write(&open.slot_id, "anything/at/all"));
    }

    #[test]
    fn test_invalid_write_scope_rejected() {
        let mut p = pool();
        let err = p
            .acquire(L2Request::new("w1").with_write_scope(["src/[.rs"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(p.active_count(), 0);
    }

    #[test]
    fn test_release_blocked_by_task_in_progress() {
        let mut p = pool();
        let slot = p
            .acquire(L2Request::new("w1").with_locks(["src/a.rs"]))
            .unwrap();
        p.assign_task(&slot.slot_id, "t1").unwrap();
        p.update_task_status(&slot.slot_id, SlotTaskStatus::InProgress)
            .unwrap();
        let err = p.release(&slot.slot_id, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskInProgress);

        let released = p.release(&slot.slot_id, true).unwrap();
        assert_eq!(released.worker_id, "w1");
        let manager = p.lock_manager();
        let manager = manager.lock().unwrap();
        assert_eq!(manager.lock_count(), 0);
        assert!(!manager.is_write_worker("w1"));
    }

    #[test]
    fn test_complete_task_records_evidence() {
        let store = Arc::new(MemoryEvidenceStore::new());
        let mut ledger = EvidenceLedger::new(store);
        ledger.initialize_session("s1").unwrap();
        let ledger = Arc::new(Mutex::new(ledger));
        let mut p = pool().with_ledger(Arc::clone(&ledger));

        let slot = p.acquire(L2Request::new("w1")).unwrap();
        p.assign_task(&slot.slot_id, "t1").unwrap();
        let err = p
            .complete_task(&slot.slot_id, SlotTaskStatus::Completed, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingEvidence);

        let item = EvidenceItem::new("s1", "op-1", "file_write", vec![Artifact::new("a", "b")])
            .with_task("t1");
        let expected = item.evidence_id.clone();
        let task = p
            .complete_task(&slot.slot_id, SlotTaskStatus::Completed, Some(item))
            .unwrap();
        assert_eq!(task.evidence_id.as_deref(), Some(expected.as_str()));
        assert_eq!(ledger.lock().unwrap().items("s1").unwrap().len(), 1);
        p.release(&slot.slot_id, false).unwrap();
    }

    #[test]
    fn test_cleanup_stale_releases_locks() {
        let mut p = pool();
        let slot = p
            .acquire(L2Request::new("w1").with_locks(["src/a.rs"]))
            .unwrap();
        p.backdate(&slot.slot_id, chrono::Duration::hours(1));
        let released = p.cleanup_stale(Utc::now()).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(p.active_count(), 0);
        assert_eq!(p.lock_manager().lock().unwrap().lock_count(), 0);
    }
}
