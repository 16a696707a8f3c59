use super::wait_graph::WaitForGraph;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => f.write_str("read"),
            LockKind::Write => f.write_str("write"),
        }
    }
}

/// A lock held by one worker on one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub kind: LockKind,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Informational only. Nothing releases a lock because this passed.
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

fn compatible(a: LockKind, b: LockKind) -> bool {
    a == LockKind::Read && b == LockKind::Read
}

/// Process-wide lock table with a write-worker semaphore.
///
/// Locks only disappear through [`release_lock`](Self::release_lock) or
/// [`release_all`](Self::release_all).
#[derive(Debug)]
pub struct LockManager {
    locks: BTreeMap<String, Vec<FileLock>>,
    /// worker -> paths it is recorded as waiting for
    waits: BTreeMap<String, BTreeSet<String>>,
    write_workers: BTreeSet<String>,
    /// workers holding a permit through `register_write_worker`
    registered: BTreeSet<String>,
    max_write_workers: usize,
    ttl: Duration,
}

impl LockManager {
    pub fn new(max_write_workers: usize, ttl: Duration) -> Self {
        Self {
            locks: BTreeMap::new(),
            waits: BTreeMap::new(),
            write_workers: BTreeSet::new(),
            registered: BTreeSet::new(),
            max_write_workers,
            ttl,
        }
    }

    pub fn max_write_workers(&self) -> usize {
        self.max_write_workers
    }

    pub fn active_write_workers(&self) -> usize {
        self.write_workers.len()
    }

    pub fn is_write_worker(&self, worker_id: &str) -> bool {
        self.write_workers.contains(worker_id)
    }

    /// Take a write-worker permit. Idempotent per worker.
    ///
    /// A registered worker keeps its permit until it is unregistered or
    /// [`release_all`](Self::release_all) runs, even while it holds no lock.
    pub fn register_write_worker(&mut self, worker_id: &str) -> CoreResult<()> {
        self.check_semaphore(worker_id)?;
        self.write_workers.insert(worker_id.to_string());
        if self.registered.insert(worker_id.to_string()) {
            debug!(worker = worker_id, active = self.write_workers.len(), "write worker registered");
        }
        Ok(())
    }

    pub fn unregister_write_worker(&mut self, worker_id: &str) -> bool {
        self.registered.remove(worker_id);
        self.write_workers.remove(worker_id)
    }

    /// Return the permit of a worker that took it implicitly through a write
    /// lock and no longer holds one.
    fn drop_implicit_permit(&mut self, worker_id: &str) {
        if self.registered.contains(worker_id) {
            return;
        }
        let holds_write = self
            .locks
            .values()
            .flatten()
            .any(|l| l.holder == worker_id && l.kind == LockKind::Write);
        if !holds_write && self.write_workers.remove(worker_id) {
            debug!(worker = worker_id, "write permit returned");
        }
    }

    fn check_semaphore(&self, worker_id: &str) -> CoreResult<()> {
        if !self.write_workers.contains(worker_id)
            && self.write_workers.len() >= self.max_write_workers
        {
            warn!(worker = worker_id, "write semaphore exhausted");
            return Err(CoreError::new(
                ErrorKind::SemaphoreExhausted,
                format!(
                    "write-worker semaphore exhausted ({}/{})",
                    self.write_workers.len(),
                    self.max_write_workers
                ),
            )
            .with_detail("worker_id", worker_id)
            .with_detail("capacity", self.max_write_workers)
            .with_detail("active", self.write_workers.len()));
        }
        Ok(())
    }

    pub fn locks_on(&self, path: &str) -> &[FileLock] {
        self.locks.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn locks_held_by(&self, worker_id: &str) -> Vec<FileLock> {
        self.locks
            .values()
            .flatten()
            .filter(|l| l.holder == worker_id)
            .cloned()
            .collect()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.values().map(Vec::len).sum()
    }

    /// Holders whose locks on `path` conflict with `kind` requested by `worker_id`.
    fn conflicting_holders(&self, path: &str, worker_id: &str, kind: LockKind) -> Vec<String> {
        let mut holders: Vec<String> = self
            .locks_on(path)
            .iter()
            .filter(|l| l.holder != worker_id && !compatible(l.kind, kind))
            .map(|l| l.holder.clone())
            .collect();
        holders.dedup();
        holders
    }

    fn conflict_error(path: &str, worker_id: &str, kind: LockKind, holders: &[String]) -> CoreError {
        CoreError::new(
            ErrorKind::LockConflict,
            format!(
                "cannot take {} lock on {}: held by {}",
                kind,
                path,
                holders.join(", ")
            ),
        )
        .with_detail("path", path)
        .with_detail("worker_id", worker_id)
        .with_detail("kind", kind)
        .with_detail("holder", holders.first())
        .with_detail("holders", holders)
    }

    /// Acquire one lock. Read/read is the only compatible pair.
    pub fn acquire_lock(&mut self, path: &str, worker_id: &str, kind: LockKind) -> CoreResult<FileLock> {
        if let Some(existing) = self
            .locks_on(path)
            .iter()
            .find(|l| l.holder == worker_id && (l.kind == kind || l.kind == LockKind::Write))
        {
            return Ok(existing.clone());
        }

        if kind == LockKind::Write {
            self.check_semaphore(worker_id)?;
        }

        let holders = self.conflicting_holders(path, worker_id, kind);
        if !holders.is_empty() {
            debug!(path, worker = worker_id, holder = %holders[0], "lock conflict");
            return Err(Self::conflict_error(path, worker_id, kind, &holders));
        }

        Ok(self.grant(path, worker_id, kind))
    }

    fn grant(&mut self, path: &str, worker_id: &str, kind: LockKind) -> FileLock {
        if kind == LockKind::Write {
            self.write_workers.insert(worker_id.to_string());
        }
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let lock = FileLock {
            path: path.to_string(),
            kind,
            holder: worker_id.to_string(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let entry = self.locks.entry(path.to_string()).or_default();
        // upgrading read -> write replaces the worker's read lock
        entry.retain(|l| l.holder != worker_id);
        entry.push(lock.clone());
        self.clear_wait(worker_id, path);
        debug!(path, worker = worker_id, kind = %kind, "lock granted");
        lock
    }

    /// Acquire a set of locks in sorted order, all or nothing.
    ///
    /// On failure every lock newly taken by this call is released before the
    /// error is returned.
    pub fn acquire_multiple_locks(
        &mut self,
        paths: &[String],
        worker_id: &str,
        kind: LockKind,
    ) -> CoreResult<Vec<FileLock>> {
        let mut ordered: Vec<&String> = paths.iter().collect();
        ordered.sort();
        ordered.dedup();

        let was_registered = self.write_workers.contains(worker_id);
        let mut newly_acquired: Vec<String> = Vec::new();
        let mut granted = Vec::with_capacity(ordered.len());

        for path in ordered {
            let already_held = self
                .locks_on(path)
                .iter()
                .any(|l| l.holder == worker_id && (l.kind == kind || l.kind == LockKind::Write));
            match self.acquire_lock(path, worker_id, kind) {
                Ok(lock) => {
                    if !already_held {
                        newly_acquired.push(path.clone());
                    }
                    granted.push(lock);
                }
                Err(err) => {
                    let rolled_back = newly_acquired.len();
                    for acquired in &newly_acquired {
                        self.remove_lock(acquired, worker_id);
                    }
                    if !was_registered {
                        self.drop_implicit_permit(worker_id);
                    }
                    warn!(
                        worker = worker_id,
                        failed_path = %path,
                        rolled_back,
                        "multi-lock acquisition rolled back"
                    );
                    return Err(err
                        .with_detail("failed_path", path)
                        .with_detail("rolled_back", rolled_back));
                }
            }
        }
        Ok(granted)
    }

    /// Acquire a lock, failing with `Deadlock` instead of waiting when the
    /// request would close a cycle in the wait-for graph.
    ///
    /// A request that merely conflicts fails with `LockConflict` and leaves no
    /// wait behind; any wait the worker had recorded on `path` is withdrawn.
    /// Use [`wait_for_lock`](Self::wait_for_lock) to stay in the graph.
    pub fn acquire_lock_with_deadlock_check(
        &mut self,
        path: &str,
        worker_id: &str,
        kind: LockKind,
    ) -> CoreResult<FileLock> {
        self.checked_acquire(path, worker_id, kind, false)
    }

    /// Like [`acquire_lock_with_deadlock_check`](Self::acquire_lock_with_deadlock_check),
    /// but a conflict is recorded as a wait. Recorded waits take part in later
    /// checks, so cycles across any number of workers are found. The wait
    /// lasts until the lock is granted, the worker retries without waiting,
    /// or its waits are cleared.
    pub fn wait_for_lock(&mut self, path: &str, worker_id: &str, kind: LockKind) -> CoreResult<FileLock> {
        self.checked_acquire(path, worker_id, kind, true)
    }

    fn checked_acquire(
        &mut self,
        path: &str,
        worker_id: &str,
        kind: LockKind,
        record_wait: bool,
    ) -> CoreResult<FileLock> {
        if kind == LockKind::Write {
            self.check_semaphore(worker_id)?;
        }
        let holders = self.conflicting_holders(path, worker_id, kind);
        if holders.is_empty() {
            return self.acquire_lock(path, worker_id, kind);
        }

        let mut graph = self.wait_for_graph();
        for holder in &holders {
            graph.add_edge(worker_id, holder);
        }
        if let Some(cycle) = graph.find_cycle_from(worker_id) {
            warn!(path, worker = worker_id, cycle = ?cycle, "deadlock detected");
            return Err(CoreError::new(
                ErrorKind::Deadlock,
                format!(
                    "deadlock: {} waiting for {} would close cycle {}",
                    worker_id,
                    path,
                    cycle.join(" -> ")
                ),
            )
            .with_detail("path", path)
            .with_detail("worker_id", worker_id)
            .with_detail("cycle", &cycle)
            .with_detail("holders", &holders));
        }

        if record_wait {
            self.waits
                .entry(worker_id.to_string())
                .or_default()
                .insert(path.to_string());
        } else {
            self.clear_wait(worker_id, path);
        }
        Err(Self::conflict_error(path, worker_id, kind, &holders).with_detail("wait_recorded", record_wait))
    }

    /// Build the wait-for graph from every recorded wait and the current holders.
    pub fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for (waiter, paths) in &self.waits {
            for path in paths {
                for lock in self.locks_on(path) {
                    graph.add_edge(waiter, &lock.holder);
                }
            }
        }
        graph
    }

    pub fn recorded_waits(&self, worker_id: &str) -> Vec<String> {
        self.waits
            .get(worker_id)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn clear_wait(&mut self, worker_id: &str, path: &str) {
        if let Some(paths) = self.waits.get_mut(worker_id) {
            paths.remove(path);
            if paths.is_empty() {
                self.waits.remove(worker_id);
            }
        }
    }

    /// Withdraw every wait recorded for a worker.
    pub fn clear_waits(&mut self, worker_id: &str) {
        self.waits.remove(worker_id);
    }

    fn remove_lock(&mut self, path: &str, worker_id: &str) -> Option<FileLock> {
        let entry = self.locks.get_mut(path)?;
        let index = entry.iter().position(|l| l.holder == worker_id)?;
        let lock = entry.remove(index);
        if entry.is_empty() {
            self.locks.remove(path);
        }
        Some(lock)
    }

    /// Release one lock. The only way a single lock disappears.
    pub fn release_lock(&mut self, path: &str, worker_id: &str) -> CoreResult<FileLock> {
        let lock = self.remove_lock(path, worker_id).ok_or_else(|| {
            CoreError::new(
                ErrorKind::LockNotHeld,
                format!("{} holds no lock on {}", worker_id, path),
            )
            .with_detail("path", path)
            .with_detail("worker_id", worker_id)
        })?;
        if lock.kind == LockKind::Write {
            self.drop_implicit_permit(worker_id);
        }
        debug!(path, worker = worker_id, "lock released");
        Ok(lock)
    }

    /// Release every lock a worker holds, withdraw its waits and return its
    /// write permit.
    pub fn release_all(&mut self, worker_id: &str) -> Vec<FileLock> {
        let paths: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, held)| held.iter().any(|l| l.holder == worker_id))
            .map(|(path, _)| path.clone())
            .collect();
        let released: Vec<FileLock> = paths
            .iter()
            .filter_map(|p| self.remove_lock(p, worker_id))
            .collect();
        self.clear_waits(worker_id);
        self.registered.remove(worker_id);
        self.write_workers.remove(worker_id);
        if !released.is_empty() {
            info!(worker = worker_id, count = released.len(), "released all locks");
        }
        released
    }

    /// Read-only query for locks past their informational expiry.
    pub fn expired_locks(&self, now: DateTime<Utc>) -> Vec<FileLock> {
        self.locks
            .values()
            .flatten()
            .filter(|l| l.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Automatic release of stale locks is forbidden. This always fails,
    /// naming every expired lock so an operator can release them explicitly.
    pub fn sweep_expired_locks(&self, now: DateTime<Utc>) -> CoreResult<()> {
        let expired = self.expired_locks(now);
        let listed: Vec<serde_json::Value> = expired
            .iter()
            .map(|l| {
                serde_json::json!({
                    "path": l.path,
                    "holder": l.holder,
                    "expires_at": l.expires_at,
                })
            })
            .collect();
        warn!(expired = expired.len(), "refusing to auto-release expired locks");
        Err(CoreError::new(
            ErrorKind::AutoReleaseForbidden,
            format!(
                "automatic release of expired locks is forbidden ({} expired); release them explicitly",
                expired.len()
            ),
        )
        .with_detail("expired", listed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> LockManager {
        LockManager::new(4, Duration::from_secs(600))
    }

    #[test]
    fn test_read_locks_share() {
        let mut locks = manager();
        locks.acquire_lock("src/a.rs", "w1", LockKind::Read).unwrap();
        locks.acquire_lock("src/a.rs", "w2", LockKind::Read).unwrap();
        assert_eq!(locks.locks_on("src/a.rs").len(), 2);
    }

    #[test]
    fn test_write_conflicts_name_holder() {
        let mut locks = manager();
        locks.acquire_lock("src/a.ts", "w1", LockKind::Write).unwrap();
        let err = locks
            .acquire_lock("src/a.ts", "w2", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(err.detail("holder"), Some(&serde_json::json!("w1")));
        assert!(err.message().contains("w1"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_write_conflicts_with_read() {
        let mut locks = manager();
        locks.acquire_lock("f", "w1", LockKind::Read).unwrap();
        assert!(locks.acquire_lock("f", "w2", LockKind::Write).is_err());
        locks.acquire_lock("g", "w1", LockKind::Write).unwrap();
        assert!(locks.acquire_lock("g", "w2", LockKind::Read).is_err());
    }

    #[test]
    fn test_identical_request_is_idempotent() {
        let mut locks = manager();
        let first = locks.acquire_lock("f", "w1", LockKind::Write).unwrap();
        let second = locks.acquire_lock("f", "w1", LockKind::Write).unwrap();
        assert_eq!(first, second);
        assert_eq!(locks.lock_count(), 1);
    }

    #[test]
    fn test_sole_reader_can_upgrade() {
        let mut locks = manager();
        locks.acquire_lock("f", "w1", LockKind::Read).unwrap();
        let lock = locks.acquire_lock("f", "w1", LockKind::Write).unwrap();
        assert_eq!(lock.kind, LockKind::Write);
        assert_eq!(locks.locks_on("f").len(), 1);
    }

    #[test]
    fn test_multiple_locks_roll_back() {
        let mut locks = manager();
        locks.acquire_lock("c", "other", LockKind::Write).unwrap();
        let paths = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let err = locks
            .acquire_multiple_locks(&paths, "w1", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(err.detail("rolled_back"), Some(&serde_json::json!(2)));
        assert!(locks.locks_held_by("w1").is_empty());
        assert!(!locks.is_write_worker("w1"));
    }

    #[test]
    fn test_multiple_locks_sorted_and_deduped() {
        let mut locks = manager();
        let paths = vec!["z".to_string(), "a".to_string(), "z".to_string()];
        let granted = locks
            .acquire_multiple_locks(&paths, "w1", LockKind::Write)
            .unwrap();
        let order: Vec<&str> = granted.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(order, vec!["a", "z"]);
    }

    #[test]
    fn test_semaphore_caps_write_workers() {
        let mut locks = manager();
        for i in 0..4 {
            locks
                .acquire_lock(&format!("f{i}"), &format!("w{i}"), LockKind::Write)
                .unwrap();
        }
        let err = locks
            .acquire_lock("free-file", "w4", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SemaphoreExhausted);
        assert_eq!(err.detail("capacity"), Some(&serde_json::json!(4)));
        assert_eq!(err.detail("active"), Some(&serde_json::json!(4)));

        // readers are not write workers
        locks.acquire_lock("free-file", "w4", LockKind::Read).unwrap();
        // existing write workers keep taking locks
        locks.acquire_lock("g", "w0", LockKind::Write).unwrap();

        locks.release_all("w0");
        locks.acquire_lock("h", "w4", LockKind::Write).unwrap();
    }

    #[test]
    fn test_two_worker_deadlock_detected() {
        let mut locks = manager();
        locks.acquire_lock("x", "a", LockKind::Write).unwrap();
        locks.acquire_lock("y", "b", LockKind::Write).unwrap();

        let err = locks
            .wait_for_lock("y", "a", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(locks.recorded_waits("a"), vec!["y".to_string()]);

        let err = locks
            .acquire_lock_with_deadlock_check("x", "b", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);
        assert!(!err.is_recoverable());
        assert!(locks.recorded_waits("b").is_empty());
    }

    #[test]
    fn test_three_worker_deadlock_detected() {
        let mut locks = manager();
        locks.acquire_lock("p1", "w1", LockKind::Write).unwrap();
        locks.acquire_lock("p2", "w2", LockKind::Write).unwrap();
        locks.acquire_lock("p3", "w3", LockKind::Write).unwrap();

        locks.wait_for_lock("p2", "w1", LockKind::Write).unwrap_err();
        locks.wait_for_lock("p3", "w2", LockKind::Write).unwrap_err();
        let err = locks
            .acquire_lock_with_deadlock_check("p1", "w3", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deadlock);
        let cycle = err.detail("cycle").unwrap().as_array().unwrap().len();
        assert_eq!(cycle, 3);
    }

    #[test]
    fn test_grant_clears_wait() {
        let mut locks = manager();
        locks.acquire_lock("x", "a", LockKind::Write).unwrap();
        locks.wait_for_lock("x", "b", LockKind::Write).unwrap_err();
        assert_eq!(locks.recorded_waits("b").len(), 1);
        locks.release_lock("x", "a").unwrap();
        locks
            .acquire_lock_with_deadlock_check("x", "b", LockKind::Write)
            .unwrap();
        assert!(locks.recorded_waits("b").is_empty());
    }

    #[test]
    fn test_abandoned_conflict_leaves_no_wait() {
        let mut locks = manager();
        locks.acquire_lock("x", "a", LockKind::Write).unwrap();
        locks.acquire_lock("y", "b", LockKind::Write).unwrap();

        let err = locks
            .acquire_lock_with_deadlock_check("y", "a", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert_eq!(err.detail("wait_recorded"), Some(&serde_json::json!(false)));
        assert!(locks.recorded_waits("a").is_empty());

        // a gave up, so b asking for x is a plain conflict
        let err = locks
            .acquire_lock_with_deadlock_check("x", "b", LockKind::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
    }

    #[test]
    fn test_retry_without_waiting_withdraws_wait() {
        let mut locks = manager();
        locks.acquire_lock("x", "a", LockKind::Write).unwrap();
        locks.acquire_lock("y", "b", LockKind::Write).unwrap();
        locks.wait_for_lock("y", "a", LockKind::Write).unwrap_err();
        assert_eq!(locks.recorded_waits("a"), vec!["y".to_string()]);

        locks
            .acquire_lock_with_deadlock_check("y", "a", LockKind::Write)
            .unwrap_err();
        assert!(locks.recorded_waits("a").is_empty());
        let err = locks.wait_for_lock("x", "b", LockKind::Write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
    }

    #[test]
    fn test_releasing_last_write_lock_returns_permit() {
        let mut locks = manager();
        for i in 0..4 {
            let worker = format!("w{i}");
            locks
                .acquire_lock(&format!("f{i}"), &worker, LockKind::Write)
                .unwrap();
            locks.release_lock(&format!("f{i}"), &worker).unwrap();
        }
        assert_eq!(locks.lock_count(), 0);
        assert_eq!(locks.active_write_workers(), 0);
        locks.acquire_lock("f4", "w4", LockKind::Write).unwrap();
        assert!(locks.is_write_worker("w4"));
    }

    #[test]
    fn test_permit_kept_while_write_lock_remains() {
        let mut locks = manager();
        locks.acquire_lock("a", "w1", LockKind::Write).unwrap();
        locks.acquire_lock("b", "w1", LockKind::Write).unwrap();
        locks.acquire_lock("c", "w1", LockKind::Read).unwrap();
        locks.release_lock("a", "w1").unwrap();
        assert!(locks.is_write_worker("w1"));
        locks.release_lock("b", "w1").unwrap();
        assert!(!locks.is_write_worker("w1"));
        assert_eq!(locks.locks_held_by("w1").len(), 1);
    }

    #[test]
    fn test_registered_worker_keeps_permit_after_release() {
        let mut locks = manager();
        locks.register_write_worker("w1").unwrap();
        locks.acquire_lock("a", "w1", LockKind::Write).unwrap();
        locks.release_lock("a", "w1").unwrap();
        assert!(locks.is_write_worker("w1"));
        assert!(locks.unregister_write_worker("w1"));
        assert_eq!(locks.active_write_workers(), 0);
    }

    #[test]
    fn test_release_unknown_lock_fails() {
        let mut locks = manager();
        let err = locks.release_lock("nope", "w1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockNotHeld);
    }

    #[test]
    fn test_expired_locks_are_never_swept() {
        let mut locks = LockManager::new(4, Duration::from_secs(1));
        locks.acquire_lock("f", "w1", LockKind::Write).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(locks.expired_locks(later).len(), 1);

        let err = locks.sweep_expired_locks(later).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AutoReleaseForbidden);
        assert_eq!(err.detail("expired").unwrap().as_array().unwrap().len(), 1);
        // still held after the failed sweep
        assert_eq!(locks.locks_held_by("w1").len(), 1);
        assert!(locks.acquire_lock("f", "w2", LockKind::Write).is_err());
    }
}
