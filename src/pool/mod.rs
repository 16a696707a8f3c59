//! Bounded worker pools.
//!
//! [`SlotTable`] holds the bookkeeping both pools share: slots, the task each
//! slot is running, activity timestamps for health checks, and event
//! publication. [`ReadOnlyPool`] (L1) adds a FIFO backlog; [`WritePool`] (L2)
//! adds file locks, write scopes and evidence recording.

pub mod l1;
pub mod l2;

pub use l1::{L1Acquisition, ReadOnlyPool};
pub use l2::{L2Request, WritePool};

use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::locks::FileLock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolLevel {
    L1,
    L2,
}

impl PoolLevel {
    fn prefix(&self) -> &'static str {
        match self {
            PoolLevel::L1 => "l1",
            PoolLevel::L2 => "l2",
        }
    }
}

impl fmt::Display for PoolLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolLevel::L1 => f.write_str("L1"),
            PoolLevel::L2 => f.write_str("L2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotTaskStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl SlotTaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, SlotTaskStatus::Completed | SlotTaskStatus::Failed)
    }
}

/// The unit of work a slot is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotTask {
    pub task_id: String,
    pub status: SlotTaskStatus,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
}

/// One capacity unit of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub slot_id: String,
    pub worker_id: String,
    pub level: PoolLevel,
    pub permissions: Permissions,
    /// Glob patterns restricting writes. Empty means unrestricted.
    #[serde(default)]
    pub write_scope: Vec<String>,
    #[serde(default)]
    pub locks: Vec<FileLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<SlotTask>,
    pub acquired_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WorkerSlot {
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }

    pub fn has_task_in_progress(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|t| t.status == SlotTaskStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotHealth {
    Healthy,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotHealthReport {
    pub slot_id: String,
    pub worker_id: String,
    pub health: SlotHealth,
    pub idle_secs: i64,
}

/// Notifications for observers. Publishing never affects control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    SlotAcquired {
        level: PoolLevel,
        slot_id: String,
        worker_id: String,
        active: usize,
    },
    SlotQueued {
        level: PoolLevel,
        worker_id: String,
        position: usize,
    },
    SlotReleased {
        level: PoolLevel,
        slot_id: String,
        worker_id: String,
        forced: bool,
        locks_released: usize,
    },
    TaskAssigned {
        level: PoolLevel,
        slot_id: String,
        task_id: String,
    },
    TaskCompleted {
        level: PoolLevel,
        slot_id: String,
        task_id: String,
        status: SlotTaskStatus,
        evidence_id: Option<String>,
    },
    SlotStale {
        level: PoolLevel,
        slot_id: String,
        worker_id: String,
        idle_secs: i64,
    },
}

/// Slot bookkeeping shared by both pools.
#[derive(Debug)]
pub struct SlotTable {
    level: PoolLevel,
    capacity: usize,
    slots: BTreeMap<String, WorkerSlot>,
    stale_after: Duration,
    events: Option<mpsc::Sender<PoolEvent>>,
}

impl SlotTable {
    pub fn new(level: PoolLevel, capacity: usize, stale_after: Duration) -> Self {
        Self {
            level,
            capacity,
            slots: BTreeMap::new(),
            stale_after,
            events: None,
        }
    }

    pub fn set_event_channel(&mut self, tx: mpsc::Sender<PoolEvent>) {
        self.events = Some(tx);
    }

    pub fn emit(&self, event: PoolEvent) {
        if let Some(ref tx) = self.events {
            tx.try_send(event).ok();
        }
    }

    pub fn level(&self) -> PoolLevel {
        self.level
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn slot(&self, slot_id: &str) -> Option<&WorkerSlot> {
        self.slots.get(slot_id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    pub fn slot_for_worker(&self, worker_id: &str) -> Option<&WorkerSlot> {
        self.slots.values().find(|s| s.worker_id == worker_id)
    }

    pub fn capacity_error(&self, worker_id: &str) -> CoreError {
        CoreError::new(
            ErrorKind::CapacityExceeded,
            format!(
                "{} pool at capacity ({}/{})",
                self.level,
                self.slots.len(),
                self.capacity
            ),
        )
        .with_detail("pool", self.level)
        .with_detail("capacity", self.capacity)
        .with_detail("active", self.slots.len())
        .with_detail("worker_id", worker_id)
    }

    fn not_found(level: PoolLevel, slot_id: &str) -> CoreError {
        CoreError::new(
            ErrorKind::SlotNotFound,
            format!("{} slot {} not found", level, slot_id),
        )
        .with_detail("pool", level)
        .with_detail("slot_id", slot_id)
    }

    fn slot_mut(&mut self, slot_id: &str) -> CoreResult<&mut WorkerSlot> {
        let level = self.level;
        self.slots
            .get_mut(slot_id)
            .ok_or_else(|| Self::not_found(level, slot_id))
    }

    pub fn get(&self, slot_id: &str) -> CoreResult<&WorkerSlot> {
        self.slots.get(slot_id).ok_or_else(|| Self::not_found(self.level, slot_id))
    }

    /// Admit a worker into a free slot. One slot per worker.
    pub fn insert(
        &mut self,
        worker_id: &str,
        permissions: Permissions,
        write_scope: Vec<String>,
        locks: Vec<FileLock>,
    ) -> CoreResult<WorkerSlot> {
        if let Some(existing) = self.slot_for_worker(worker_id) {
            return Err(CoreError::new(
                ErrorKind::TaskInProgress,
                format!("worker {} already holds slot {}", worker_id, existing.slot_id),
            )
            .with_detail("worker_id", worker_id)
            .with_detail("slot_id", &existing.slot_id));
        }
        if self.is_full() {
            return Err(self.capacity_error(worker_id));
        }
        let now = Utc::now();
        let slot = WorkerSlot {
            slot_id: format!("{}-{}", self.level.prefix(), Uuid::new_v4()),
            worker_id: worker_id.to_string(),
            level: self.level,
            permissions,
            write_scope,
            locks,
            task: None,
            acquired_at: now,
            last_activity: now,
        };
        self.slots.insert(slot.slot_id.clone(), slot.clone());
        debug!(pool = %self.level, slot = %slot.slot_id, worker = worker_id, "slot acquired");
        self.emit(PoolEvent::SlotAcquired {
            level: self.level,
            slot_id: slot.slot_id.clone(),
            worker_id: worker_id.to_string(),
            active: self.slots.len(),
        });
        Ok(slot)
    }

    /// Drop a slot from the table. Callers release resources first.
    pub fn remove(&mut self, slot_id: &str, forced: bool, locks_released: usize) -> CoreResult<WorkerSlot> {
        let slot = self.slots.remove(slot_id).ok_or_else(|| Self::not_found(self.level, slot_id))?;
        debug!(pool = %self.level, slot = slot_id, forced, "slot released");
        self.emit(PoolEvent::SlotReleased {
            level: self.level,
            slot_id: slot.slot_id.clone(),
            worker_id: slot.worker_id.clone(),
            forced,
            locks_released,
        });
        Ok(slot)
    }

    pub fn touch(&mut self, slot_id: &str) -> CoreResult<()> {
        self.slot_mut(slot_id)?.last_activity = Utc::now();
        Ok(())
    }

    pub fn assign_task(&mut self, slot_id: &str, task_id: &str) -> CoreResult<()> {
        let level = self.level;
        let slot = self.slot_mut(slot_id)?;
        if let Some(current) = slot.task.as_ref().filter(|t| !t.status.is_finished()) {
            return Err(CoreError::new(
                ErrorKind::TaskInProgress,
                format!("slot {} is busy with task {}", slot_id, current.task_id),
            )
            .with_detail("slot_id", slot_id)
            .with_detail("task_id", &current.task_id));
        }
        let now = Utc::now();
        slot.task = Some(SlotTask {
            task_id: task_id.to_string(),
            status: SlotTaskStatus::Assigned,
            assigned_at: now,
            updated_at: now,
            evidence_id: None,
        });
        slot.last_activity = now;
        self.emit(PoolEvent::TaskAssigned {
            level,
            slot_id: slot_id.to_string(),
            task_id: task_id.to_string(),
        });
        Ok(())
    }

    fn task_mut<'a>(slot: &'a mut WorkerSlot) -> CoreResult<&'a mut SlotTask> {
        let slot_id = slot.slot_id.clone();
        slot.task.as_mut().ok_or_else(|| {
            CoreError::new(
                ErrorKind::NoTaskAssigned,
                format!("slot {} has no task", slot_id),
            )
            .with_detail("slot_id", slot_id)
        })
    }

    pub fn update_task_status(&mut self, slot_id: &str, status: SlotTaskStatus) -> CoreResult<()> {
        let slot = self.slot_mut(slot_id)?;
        let now = Utc::now();
        slot.last_activity = now;
        let task = Self::task_mut(slot)?;
        task.status = status;
        task.updated_at = now;
        Ok(())
    }

    /// Finish the slot's task. A completed task must name its evidence.
    pub fn complete_task(
        &mut self,
        slot_id: &str,
        status: SlotTaskStatus,
        evidence_id: Option<String>,
    ) -> CoreResult<SlotTask> {
        let level = self.level;
        let slot = self.slot_mut(slot_id)?;
        let task_id = Self::task_mut(slot)?.task_id.clone();
        if status == SlotTaskStatus::Completed && evidence_id.is_none() {
            return Err(CoreError::new(
                ErrorKind::MissingEvidence,
                format!("task {} cannot be completed without evidence", task_id),
            )
            .with_detail("slot_id", slot_id)
            .with_detail("task_id", &task_id));
        }
        let now = Utc::now();
        slot.last_activity = now;
        let task = Self::task_mut(slot)?;
        task.status = status;
        task.updated_at = now;
        task.evidence_id = evidence_id;
        let finished = task.clone();
        self.emit(PoolEvent::TaskCompleted {
            level,
            slot_id: slot_id.to_string(),
            task_id: finished.task_id.clone(),
            status,
            evidence_id: finished.evidence_id.clone(),
        });
        Ok(finished)
    }

    /// Classify every slot by its idle time.
    pub fn health_check(&self, now: DateTime<Utc>) -> Vec<SlotHealthReport> {
        let threshold = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        self.slots
            .values()
            .map(|slot| {
                let idle = slot.idle_for(now);
                SlotHealthReport {
                    slot_id: slot.slot_id.clone(),
                    worker_id: slot.worker_id.clone(),
                    health: if idle > threshold {
                        SlotHealth::Stale
                    } else {
                        SlotHealth::Healthy
                    },
                    idle_secs: idle.num_seconds(),
                }
            })
            .collect()
    }

    /// Ids of stale slots, with a warning and event per slot.
    pub fn stale_slots(&self, now: DateTime<Utc>) -> Vec<String> {
        self.health_check(now)
            .into_iter()
            .filter(|r| r.health == SlotHealth::Stale)
            .map(|r| {
                warn!(pool = %self.level, slot = %r.slot_id, idle_secs = r.idle_secs, "stale slot");
                self.emit(PoolEvent::SlotStale {
                    level: self.level,
                    slot_id: r.slot_id.clone(),
                    worker_id: r.worker_id.clone(),
                    idle_secs: r.idle_secs,
                });
                r.slot_id
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, slot_id: &str, by: chrono::Duration) {
        if let Some(slot) = self.slots.get_mut(slot_id) {
            slot.last_activity -= by;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SlotTable {
        SlotTable::new(PoolLevel::L2, 2, Duration::from_secs(300))
    }

    #[test]
    fn test_capacity_error_details() {
        let mut t = table();
        t.insert("w1", Permissions::read_write(), vec![], vec![]).unwrap();
        t.insert("w2", Permissions::read_write(), vec![], vec![]).unwrap();
        let err = t
            .insert("w3", Permissions::read_write(), vec![], vec![])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(err.detail("capacity"), Some(&serde_json::json!(2)));
        assert_eq!(err.detail("active"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_unknown_slot_named_in_error() {
        let mut t = table();
        let err = t.assign_task("nope", "t1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotNotFound);
        assert_eq!(err.message(), "L2 slot nope not found");
        assert_eq!(err.detail("slot_id"), Some(&serde_json::json!("nope")));
        assert!(t.touch("nope").is_err());
    }

    #[test]
    fn test_one_slot_per_worker() {
        let mut t = table();
        t.insert("w1", Permissions::read_only(), vec![], vec![]).unwrap();
        assert!(t.insert("w1", Permissions::read_only(), vec![], vec![]).is_err());
    }

    #[test]
    fn test_task_lifecycle_requires_evidence() {
        let mut t = table();
        let slot = t.insert("w1", Permissions::read_write(), vec![], vec![]).unwrap();
        let err = t
            .complete_task(&slot.slot_id, SlotTaskStatus::Completed, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTaskAssigned);

        t.assign_task(&slot.slot_id, "task-1").unwrap();
        let err = t.assign_task(&slot.slot_id, "task-2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskInProgress);

        t.update_task_status(&slot.slot_id, SlotTaskStatus::InProgress)
            .unwrap();
        let err = t
            .complete_task(&slot.slot_id, SlotTaskStatus::Completed, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingEvidence);

        let task = t
            .complete_task(
                &slot.slot_id,
                SlotTaskStatus::Completed,
                Some("ev-1".to_string()),
            )
            .unwrap();
        assert_eq!(task.evidence_id.as_deref(), Some("ev-1"));
        // a finished task frees the slot for the next assignment
        t.assign_task(&slot.slot_id, "task-2").unwrap();
    }

    #[test]
    fn test_failed_task_needs_no_evidence() {
        let mut t = table();
        let slot = t.insert("w1", Permissions::read_write(), vec![], vec![]).unwrap();
        t.assign_task(&slot.slot_id, "task-1").unwrap();
        let task = t
            .complete_task(&slot.slot_id, SlotTaskStatus::Failed, None)
            .unwrap();
        assert_eq!(task.status, SlotTaskStatus::Failed);
    }

    #[test]
    fn test_health_check_flags_stale() {
        let mut t = table();
        let fresh = t.insert("w1", Permissions::read_write(), vec![], vec![]).unwrap();
        let old = t.insert("w2", Permissions::read_write(), vec![], vec![]).unwrap();
        t.backdate(&old.slot_id, chrono::Duration::minutes(10));
        let stale = t.stale_slots(Utc::now());
        assert_eq!(stale, vec![old.slot_id.clone()]);
        let health: Vec<SlotHealth> = t
            .health_check(Utc::now())
            .into_iter()
            .filter(|r| r.slot_id == fresh.slot_id)
            .map(|r| r.health)
            .collect();
        assert_eq!(health, vec![SlotHealth::Healthy]);
    }

    #[tokio::test]
    async fn test_events_published_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut t = table();
        t.set_event_channel(tx);
        let slot = t.insert("w1", Permissions::read_write(), vec![], vec![]).unwrap();
        // channel is full now; this must not fail or block
        t.assign_task(&slot.slot_id, "task-1").unwrap();
        match rx.recv().await {
            Some(PoolEvent::SlotAcquired { worker_id, active, .. }) => {
                assert_eq!(worker_id, "w1");
                assert_eq!(active, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
