//! L1 pool: read-only workers with a FIFO backlog.

use super::{PoolEvent, PoolLevel, Permissions, SlotHealthReport, SlotTable, SlotTask, SlotTaskStatus, WorkerSlot};
use crate::config::PhasegateConfig;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outcome of an L1 acquisition request.
#[derive(Debug, Clone)]
pub enum L1Acquisition {
    Granted(WorkerSlot),
    /// Waiting in the backlog; `position` is 1-based.
    Queued { position: usize },
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    worker_id: String,
    queued_at: DateTime<Utc>,
}

/// Pool of read-only worker slots.
///
/// Slots never carry write permission. When the pool is full, requests wait in
/// arrival order and are granted one-for-one as slots are released.
#[derive(Debug)]
pub struct ReadOnlyPool {
    table: SlotTable,
    queue: VecDeque<QueuedRequest>,
    queue_enabled: bool,
}

impl ReadOnlyPool {
    pub fn new(capacity: usize, queue_enabled: bool, stale_after: Duration) -> Self {
        Self {
            table: SlotTable::new(PoolLevel::L1, capacity, stale_after),
            queue: VecDeque::new(),
            queue_enabled,
        }
    }

    pub fn from_config(config: &PhasegateConfig) -> Self {
        Self::new(
            config.pools.l1_capacity,
            config.pools.l1_queue_enabled,
            config.stale_after(),
        )
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

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn slot(&self, slot_id: &str) -> Option<&WorkerSlot> {
        self.table.slot(slot_id)
    }

    pub fn slot_for_worker(&self, worker_id: &str) -> Option<&WorkerSlot> {
        self.table.slot_for_worker(worker_id)
    }

    pub fn slots(&self) -> Vec<WorkerSlot> {
        self.table.slots().cloned().collect()
    }

    /// 1-based backlog position of a worker, if it is waiting.
    pub fn queued_position(&self, worker_id: &str) -> Option<usize> {
        self.queue
            .iter()
            .position(|q| q.worker_id == worker_id)
            .map(|i| i + 1)
    }

    pub fn acquire(&mut self, worker_id: &str) -> CoreResult<L1Acquisition> {
        if !self.table.is_full() {
            let slot = self
                .table
                .insert(worker_id, Permissions::read_only(), Vec::new(), Vec::new())?;
            return Ok(L1Acquisition::Granted(slot));
        }
        if !self.queue_enabled {
            return Err(self.table.capacity_error(worker_id));
        }
        if let Some(position) = self.queued_position(worker_id) {
            return Ok(L1Acquisition::Queued { position });
        }
        self.queue.push_back(QueuedRequest {
            worker_id: worker_id.to_string(),
            queued_at: Utc::now(),
        });
        let position = self.queue.len();
        debug!(worker = worker_id, position, "L1 request queued");
        self.table.emit(PoolEvent::SlotQueued {
            level: PoolLevel::L1,
            worker_id: worker_id.to_string(),
            position,
        });
        Ok(L1Acquisition::Queued { position })
    }

    /// Withdraw a queued request. Returns false if the worker was not waiting.
    pub fn cancel_queued(&mut self, worker_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|q| q.worker_id != worker_id);
        before != self.queue.len()
    }

    /// Release a slot and hand the freed capacity to the oldest waiter.
    pub fn release(&mut self, slot_id: &str) -> CoreResult<Option<WorkerSlot>> {
        self.table.remove(slot_id, false, 0)?;
        self.grant_next()
    }

    fn grant_next(&mut self) -> CoreResult<Option<WorkerSlot>> {
        while !self.table.is_full() {
            let Some(next) = self.queue.pop_front() else {
                return Ok(None);
            };
            // a waiter that already got a slot elsewhere is dropped
            if self.table.slot_for_worker(&next.worker_id).is_some() {
                continue;
            }
            let waited = Utc::now() - next.queued_at;
            let slot = self.table.insert(
                &next.worker_id,
                Permissions::read_only(),
                Vec::new(),
                Vec::new(),
            )?;
            debug!(
                worker = %next.worker_id,
                waited_ms = waited.num_milliseconds(),
                "queued L1 request granted"
            );
            return Ok(Some(slot));
        }
        Ok(None)
    }

    pub fn assign_task(&mut self, slot_id: &str, task_id: &str) -> CoreResult<()> {
        self.table.assign_task(slot_id, task_id)
    }

    pub fn update_task_status(&mut self, slot_id: &str, status: SlotTaskStatus) -> CoreResult<()> {
        self.table.update_task_status(slot_id, status)
    }

    pub fn complete_task(
        &mut self,
        slot_id: &str,
        status: SlotTaskStatus,
        evidence_id: Option<String>,
    ) -> CoreResult<SlotTask> {
        self.table.complete_task(slot_id, status, evidence_id)
    }

    /// L1 slots are read-only; every write is refused.
    pub fn check_write(&self, slot_id: &str, path: &str) -> CoreResult<()> {
        let slot = self.table.get(slot_id)?;
        Err(CoreError::new(
            ErrorKind::PermissionDenied,
            format!("L1 slot {} may not write {}", slot.slot_id, path),
        )
        .with_detail("slot_id", &slot.slot_id)
        .with_detail("path", path))
    }

    pub fn health_check(&self, now: DateTime<Utc>) -> Vec<SlotHealthReport> {
        self.table.health_check(now)
    }

    /// Release every stale slot, then drain the backlog into freed capacity.
    /// Returns the released slots.
    pub fn cleanup_stale(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<WorkerSlot>> {
        let mut released = Vec::new();
        for slot_id in self.table.stale_slots(now) {
            released.push(self.table.remove(&slot_id, true, 0)?);
        }
        while self.grant_next()?.is_some() {}
        if !released.is_empty() {
            info!(count = released.len(), "stale L1 slots released");
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

    fn pool(capacity: usize, queue: bool) -> ReadOnlyPool {
        ReadOnlyPool::new(capacity, queue, Duration::from_secs(300))
    }

    fn granted(a: L1Acquisition) -> WorkerSlot {
        match a {
            L1Acquisition::Granted(slot) => slot,
            other => panic!("expected grant, got {other:?}"),
        }
    }

    #[test]
    fn test_default_capacity_is_nine() {
        let p = ReadOnlyPool::from_config(&PhasegateConfig::default());
        assert_eq!(p.capacity(), 9);
    }

    #[test]
    fn test_slots_are_read_only() {
        let mut p = pool(2, true);
        let slot = granted(p.acquire("r1").unwrap());
        assert!(slot.permissions.read);
        assert!(!slot.permissions.write);
        let err = p.check_write(&slot.slot_id, "src/lib.rs").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut p = pool(1, true);
        let first = granted(p.acquire("r1").unwrap());
        assert!(matches!(
            p.acquire("r2").unwrap(),
            L1Acquisition::Queued { position: 1 }
        ));
        assert!(matches!(
            p.acquire("r3").unwrap(),
            L1Acquisition::Queued { position: 2 }
        ));
        // asking again keeps the original position
        assert!(matches!(
            p.acquire("r2").unwrap(),
            L1Acquisition::Queued { position: 1 }
        ));

        let next = p.release(&first.slot_id).unwrap().unwrap();
        assert_eq!(next.worker_id, "r2");
        assert_eq!(p.queued_position("r3"), Some(1));
        let next = p.release(&next.slot_id).unwrap().unwrap();
        assert_eq!(next.worker_id, "r3");
        assert_eq!(p.queue_len(), 0);
    }

    #[test]
    fn test_full_without_queue_fails() {
        let mut p = pool(1, false);
        p.acquire("r1").unwrap();
        let err = p.acquire("r2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        assert_eq!(err.detail("capacity"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_cancel_queued() {
        let mut p = pool(1, true);
        let first = granted(p.acquire("r1").unwrap());
        p.acquire("r2").unwrap();
        assert!(p.cancel_queued("r2"));
        assert!(!p.cancel_queued("r2"));
        assert!(p.release(&first.slot_id).unwrap().is_none());
    }

    #[test]
    fn test_cleanup_stale_drains_queue() {
        let mut p = pool(1, true);
        let first = granted(p.acquire("r1").unwrap());
        p.acquire("r2").unwrap();
        p.backdate(&first.slot_id, chrono::Duration::minutes(30));

        let released = p.cleanup_stale(Utc::now()).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].worker_id, "r1");
        assert!(p.slot_for_worker("r2").is_some());
        assert_eq!(p.queue_len(), 0);
    }

    #[test]
    fn test_release_unknown_slot() {
        let mut p = pool(1, true);
        let err = p.release("l1-missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SlotNotFound);
    }
}
