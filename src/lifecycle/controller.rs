use super::gate;
use super::report::FinalReport;
use crate::config::PhasegateConfig;
use crate::continuation::{ContinuationController, ContinuationRequest};
use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::phase::Phase;
use crate::session::{OverallStatus, PhaseStatus, Session, SessionStore, TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The seven-phase state machine for one session.
///
/// Every mutation is written through the [`SessionStore`] before the call
/// returns, so a restarted process can [`resume`](Self::resume) exactly where
/// the previous one stopped.
pub struct LifecycleController {
    store: Arc<dyn SessionStore>,
    session: Option<Session>,
    continuation: ContinuationController,
    max_retries: u32,
    phase_timeouts: BTreeMap<Phase, Duration>,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn SessionStore>, config: &PhasegateConfig) -> Self {
        let phase_timeouts = Phase::ALL
            .iter()
            .filter_map(|p| config.phase_timeout(*p).map(|t| (*p, t)))
            .collect();
        Self {
            store,
            session: None,
            continuation: ContinuationController::new(
                config.continuation_timeout(),
                config.continuation.min_progress,
            ),
            max_retries: config.lifecycle.max_retries,
            phase_timeouts,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn continuation(&self) -> &ContinuationController {
        &self.continuation
    }

    pub fn session(&self) -> CoreResult<&Session> {
        self.session.as_ref().ok_or_else(not_initialized)
    }

    fn session_mut(&mut self) -> CoreResult<&mut Session> {
        self.session.as_mut().ok_or_else(not_initialized)
    }

    fn persist(&mut self) -> CoreResult<()> {
        let session = self.session_mut()?;
        session.touch();
        let session = self.session()?;
        self.store.save(session)
    }

    fn apply_timeouts(&self, session: &mut Session) {
        for (phase, timeout) in &self.phase_timeouts {
            session.phase_record_mut(*phase).timeout_secs = Some(timeout.as_secs());
        }
    }

    /// Start a fresh session at the first phase with every flag cleared.
    pub fn initialize(&mut self, session_id: &str) -> CoreResult<&Session> {
        let mut session = Session::new(session_id);
        self.apply_timeouts(&mut session);
        let first = session.current_phase();
        let record = session.phase_record_mut(first);
        record.status = PhaseStatus::InProgress;
        record.started_at = Some(Utc::now());
        self.session = Some(session);
        self.persist()?;
        info!(session = session_id, phase = %first, "session initialized");
        self.session()
    }

    /// Reload a persisted session.
    pub fn resume(&mut self, session_id: &str) -> CoreResult<&Session> {
        let session = self.store.load(session_id)?.ok_or_else(|| {
            CoreError::new(
                ErrorKind::SessionNotInitialized,
                format!("session {} does not exist", session_id),
            )
            .with_detail("session_id", session_id)
        })?;
        session.check_consistency()?;
        info!(
            session = session_id,
            phase = %session.current_phase(),
            status = %session.overall_status(),
            "session resumed"
        );
        self.session = Some(session);
        self.session()
    }

    /// Full snapshot as JSON.
    pub fn serialize(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self.session()?)
            .map_err(|e| CoreError::serialization("Failed to serialize session", e))
    }

    /// Replace the in-memory session with a snapshot and persist it.
    pub fn deserialize(&mut self, snapshot: &str) -> CoreResult<&Session> {
        let session: Session = serde_json::from_str(snapshot)
            .map_err(|e| CoreError::serialization("Failed to parse session snapshot", e))?;
        session.check_consistency()?;
        self.session = Some(session);
        self.persist()?;
        self.session()
    }

    fn ensure_accepting(&self) -> CoreResult<()> {
        let session = self.session()?;
        let status = session.overall_status();
        if status.is_terminal() {
            return Err(CoreError::new(
                ErrorKind::SessionHalted,
                format!("session {} is {} and accepts no transitions", session.session_id, status),
            )
            .with_detail("session_id", &session.session_id)
            .with_detail("status", status.to_string()));
        }
        Ok(())
    }

    /// Refuse to move past an incomplete or evidence-less checkpoint unless
    /// continuation control says so.
    fn ensure_may_advance(&self) -> CoreResult<()> {
        self.ensure_accepting()?;
        let session = self.session()?;
        let action = self
            .continuation
            .determine_next_action(&session.continuation_state());
        if !action.proceed {
            return Err(CoreError::new(
                ErrorKind::SessionHalted,
                format!("session {} may not advance: {}", session.session_id, action.reason),
            )
            .with_detail("session_id", &session.session_id)
            .with_detail("status", session.overall_status().to_string())
            .with_detail("reason", &action.reason));
        }
        Ok(())
    }

    /// Validate the current phase's gate and advance on success.
    ///
    /// On failure the phase is marked failed, the session becomes INCOMPLETE,
    /// and the current phase does not change. Completing the last phase leaves
    /// the session COMPLETE without a further transition. Returns the phase
    /// that is current after the call.
    pub fn complete_current_phase(
        &mut self,
        evidence: Option<&Value>,
        status: PhaseStatus,
    ) -> CoreResult<Phase> {
        self.ensure_may_advance()?;
        let phase = self.session()?.current_phase();

        let outcome = if status == PhaseStatus::Completed {
            gate::check(phase, evidence, self.session()?)
        } else {
            Err(CoreError::new(
                ErrorKind::GateFailed,
                format!("phase {} reported status {:?}", phase, status),
            )
            .with_detail("phase", phase.slug())
            .with_detail("reported_status", status)
            .with_detail("missing_fields", Vec::<String>::new()))
        };

        if let Err(err) = outcome {
            let session = self.session_mut()?;
            let record = session.phase_record_mut(phase);
            record.status = PhaseStatus::Failed;
            record.last_failure = Some(err.message().to_string());
            session.mark_incomplete();
            session.apply_error(Some(phase), &err);
            self.persist()?;
            warn!(phase = %phase, error = %err, "phase gate failed");
            return Err(err);
        }

        let now = Utc::now();
        let session = self.session_mut()?;
        let record = session.phase_record_mut(phase);
        record.status = PhaseStatus::Completed;
        record.completed_at = Some(now);
        record.duration_ms = record.started_at.map(|s| (now - s).num_milliseconds());
        record.last_failure = None;
        session.push_completed(phase);
        if session.flags().incomplete {
            session.clear_incomplete();
        }
        info!(phase = %phase, "phase completed");

        match phase.next() {
            Some(next) => {
                self.advance_to(next)?;
                Ok(next)
            }
            None => {
                self.persist()?;
                info!(session = %self.session()?.session_id, "all phases completed");
                Ok(phase)
            }
        }
    }

    fn advance_to(&mut self, target: Phase) -> CoreResult<()> {
        let session = self.session_mut()?;
        session.set_current_phase(target);
        let record = session.phase_record_mut(target);
        record.status = PhaseStatus::InProgress;
        record.started_at = Some(Utc::now());
        self.persist()?;
        debug!(phase = %target, "entered phase");
        Ok(())
    }

    /// Guarded transition: only to the immediate successor of a completed phase.
    pub fn transition_to(&mut self, target: Phase) -> CoreResult<()> {
        self.ensure_accepting()?;
        let session = self.session()?;
        let current = session.current_phase();
        let invalid = |reason: &str| {
            CoreError::new(
                ErrorKind::InvalidTransition,
                format!("cannot transition from {} to {}: {}", current, target, reason),
            )
            .with_detail("from", current.slug())
            .with_detail("to", target.slug())
        };
        if current.next() != Some(target) {
            return Err(invalid("target is not the next phase"));
        }
        if !session.phases_completed().contains(&current) {
            return Err(invalid("current phase has not completed"));
        }
        self.advance_to(target)
    }

    /// Halt the session: overall status becomes ERROR.
    pub fn handle_critical_error(&mut self, err: &CoreError) -> CoreResult<()> {
        let session = self.session_mut()?;
        let phase = session.current_phase();
        session.mark_error();
        session.apply_error(Some(phase), err);
        self.persist()?;
        error!(phase = %phase, error = %err, "critical error, session halted");
        Ok(())
    }

    /// Count a retry for `phase`. Past the configured bound the session is
    /// marked ERROR and `RetryExhausted` is returned.
    pub fn handle_recoverable_error(&mut self, phase: Phase, err: &CoreError) -> CoreResult<u32> {
        let max_retries = self.max_retries;
        let session = self.session_mut()?;
        let record = session.phase_record_mut(phase);
        record.retry_count += 1;
        record.last_failure = Some(err.message().to_string());
        let retries = record.retry_count;

        if retries > max_retries {
            let exhausted = CoreError::new(
                ErrorKind::RetryExhausted,
                format!(
                    "phase {} exceeded {} retries: {}",
                    phase,
                    max_retries,
                    err.message()
                ),
            )
            .with_detail("phase", phase.slug())
            .with_detail("retry_count", retries)
            .with_detail("max_retries", max_retries)
            .with_detail("cause", err.code());
            self.handle_critical_error(&exhausted)?;
            return Err(exhausted);
        }

        if matches!(record.status, PhaseStatus::TimedOut | PhaseStatus::Failed) {
            record.status = PhaseStatus::InProgress;
            record.started_at = Some(Utc::now());
        }
        session.apply_error(Some(phase), err);
        self.persist()?;
        warn!(phase = %phase, retry = retries, max = max_retries, error = %err, "recoverable error");
        Ok(retries)
    }

    pub fn set_phase_timeout(&mut self, phase: Phase, timeout: Duration) -> CoreResult<()> {
        self.phase_timeouts.insert(phase, timeout);
        self.session_mut()?.phase_record_mut(phase).timeout_secs = Some(timeout.as_secs());
        self.persist()
    }

    pub fn check_and_handle_timeout(&mut self) -> CoreResult<bool> {
        self.check_and_handle_timeout_at(Utc::now())
    }

    /// Mark the current phase timed out when its elapsed time exceeds the
    /// bound, then route into the recoverable-error path. Returns whether a
    /// timeout fired.
    pub fn check_and_handle_timeout_at(&mut self, now: DateTime<Utc>) -> CoreResult<bool> {
        let session = self.session()?;
        if session.overall_status().is_terminal() {
            return Ok(false);
        }
        let phase = session.current_phase();
        let record = session.phase_record(phase);
        let (Some(started), Some(limit)) = (record.started_at, record.timeout_secs) else {
            return Ok(false);
        };
        if record.status != PhaseStatus::InProgress {
            return Ok(false);
        }
        let elapsed = (now - started).num_seconds();
        if elapsed <= limit as i64 {
            return Ok(false);
        }

        self.session_mut()?.phase_record_mut(phase).status = PhaseStatus::TimedOut;
        let err = CoreError::new(
            ErrorKind::PhaseTimedOut,
            format!("phase {} timed out after {}s (limit {}s)", phase, elapsed, limit),
        )
        .with_detail("phase", phase.slug())
        .with_detail("elapsed_secs", elapsed)
        .with_detail("timeout_secs", limit);
        self.handle_recoverable_error(phase, &err)?;
        Ok(true)
    }

    fn require_execution(&self, operation: &str) -> CoreResult<()> {
        let phase = self.session()?.current_phase();
        if phase != Phase::Execution {
            return Err(CoreError::new(
                ErrorKind::InvalidTransition,
                format!("{} is only allowed during execution, current phase is {}", operation, phase),
            )
            .with_detail("phase", phase.slug()));
        }
        Ok(())
    }

    /// Mark tasks as running concurrently in the execution phase.
    pub fn start_parallel_tasks(&mut self, task_ids: &[String]) -> CoreResult<()> {
        self.ensure_accepting()?;
        self.require_execution("starting parallel tasks")?;
        let session = self.session()?;
        for id in task_ids {
            if session.active_parallel_tasks().contains(id) {
                return Err(CoreError::new(
                    ErrorKind::InvalidTransition,
                    format!("task {} is already active", id),
                )
                .with_detail("task_id", id));
            }
            if session.task(id).map(|t| t.status) == Some(TaskStatus::Completed) {
                return Err(CoreError::new(
                    ErrorKind::InvalidTransition,
                    format!("task {} already completed", id),
                )
                .with_detail("task_id", id));
            }
        }

        let session = self.session_mut()?;
        for id in task_ids {
            if session.task(id).is_none() {
                session.insert_task(TaskRecord::new(id, Phase::Execution));
            }
            if let Some(task) = session.task_mut(id) {
                task.status = TaskStatus::InProgress;
                task.attempts += 1;
                task.started_at = Utc::now();
                task.completed_at = None;
            }
            session.active_parallel_tasks_mut().insert(id.clone());
        }
        self.persist()?;
        debug!(count = task_ids.len(), "parallel tasks started");
        Ok(())
    }

    fn take_active(&mut self, task_id: &str) -> CoreResult<()> {
        let session = self.session()?;
        if !session.active_parallel_tasks().contains(task_id) {
            return Err(CoreError::new(
                ErrorKind::TaskNotActive,
                format!("task {} is not active", task_id),
            )
            .with_detail("task_id", task_id)
            .with_detail("session_id", &session.session_id));
        }
        Ok(())
    }

    /// Finish an active task. Evidence must be a non-null value; ids found
    /// under `evidence_id` or `evidence_ids` are attached to the task.
    pub fn complete_parallel_task(&mut self, task_id: &str, evidence: Option<&Value>) -> CoreResult<()> {
        self.take_active(task_id)?;
        let evidence = match evidence {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(CoreError::new(
                    ErrorKind::MissingEvidence,
                    format!("task {} cannot complete without evidence", task_id),
                )
                .with_detail("task_id", task_id));
            }
        };
        let ids = evidence_ids(evidence);

        let session = self.session_mut()?;
        session.active_parallel_tasks_mut().remove(task_id);
        if let Some(task) = session.task_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.last_error = None;
            for id in ids {
                if !task.evidence_ids.contains(&id) {
                    task.evidence_ids.push(id);
                }
            }
        }
        self.persist()?;
        info!(task = task_id, "parallel task completed");
        Ok(())
    }

    /// Finish an active task as failed.
    pub fn fail_parallel_task(&mut self, task_id: &str, reason: &str) -> CoreResult<()> {
        self.take_active(task_id)?;
        let session = self.session_mut()?;
        session.active_parallel_tasks_mut().remove(task_id);
        if let Some(task) = session.task_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.last_error = Some(reason.to_string());
        }
        self.persist()?;
        warn!(task = task_id, reason, "parallel task failed");
        Ok(())
    }

    /// Hand an active task to a human. The session becomes INCOMPLETE.
    pub fn escalate_task(&mut self, task_id: &str, reason: &str) -> CoreResult<()> {
        self.take_active(task_id)?;
        let session = self.session_mut()?;
        session.active_parallel_tasks_mut().remove(task_id);
        if let Some(task) = session.task_mut(task_id) {
            task.status = TaskStatus::Escalated;
            task.completed_at = Some(Utc::now());
            task.last_error = Some(reason.to_string());
        }
        session.mark_incomplete();
        self.persist()?;
        warn!(task = task_id, reason, "task escalated");
        Ok(())
    }

    /// Surface an error at the session boundary, raising whatever flag its kind forces.
    pub fn record_error(&mut self, err: &CoreError) -> CoreResult<()> {
        let session = self.session_mut()?;
        let phase = session.current_phase();
        session.apply_error(Some(phase), err);
        self.persist()
    }

    pub fn request_continuation(&mut self) -> CoreResult<ContinuationRequest> {
        let state = self.session()?.continuation_state();
        let request = self.continuation.request_continuation(&state)?;
        self.session_mut()?.set_continuation_in_progress(true);
        self.persist()?;
        Ok(request)
    }

    /// Record an explicit approval, opening a request first when none is pending.
    ///
    /// Only an INCOMPLETE session can be approved; the approval covers the
    /// current checkpoint and nothing after it.
    pub fn approve_continuation(&mut self, approver: &str) -> CoreResult<ContinuationRequest> {
        let session = self.session()?;
        let session_id = session.session_id.clone();
        let status = session.overall_status();
        if status != OverallStatus::Incomplete {
            return Err(CoreError::new(
                ErrorKind::ContinuationRejected,
                format!("session {} is {}, only an INCOMPLETE checkpoint can be approved", session_id, status),
            )
            .with_detail("session_id", &session_id)
            .with_detail("status", status.to_string()));
        }
        if self.continuation.pending_request(&session_id).is_none() {
            // An in-flight flag restored from disk has no live request behind it.
            self.session_mut()?.set_continuation_in_progress(false);
            self.request_continuation()?;
        }
        let request = self.continuation.approve(&session_id, approver)?;
        self.session_mut()?.set_explicit_approval(true);
        self.persist()?;
        Ok(request)
    }

    pub fn reject_continuation(&mut self, reason: &str) -> CoreResult<ContinuationRequest> {
        let session_id = self.session()?.session_id.clone();
        let request = self.continuation.reject(&session_id, reason)?;
        self.session_mut()?.set_continuation_in_progress(false);
        self.persist()?;
        Ok(request)
    }

    /// Expire stale continuation requests and drop the in-flight flag they held.
    pub fn expire_stale_requests(&mut self, now: DateTime<Utc>) -> CoreResult<usize> {
        let session_id = self.session()?.session_id.clone();
        let expired = self.continuation.expire_stale_requests(now);
        if expired.iter().any(|r| r.session_id == session_id) {
            self.session_mut()?.set_continuation_in_progress(false);
            self.persist()?;
        }
        Ok(expired.len())
    }

    /// Build the final report and persist it as `report.json`. Returns the
    /// report and where it was written.
    pub fn generate_final_report(&mut self) -> CoreResult<(FinalReport, String)> {
        let session = self.session()?;
        let runs = self.store.executor_runs(&session.session_id)?.len();
        let report = FinalReport::from_session(session, runs);
        let path = self.store.write_report(&report)?;
        info!(session = %report.session_id, status = %report.overall_status, path = %path, "final report written");
        Ok((report, path))
    }
}

fn not_initialized() -> CoreError {
    CoreError::new(
        ErrorKind::SessionNotInitialized,
        "no session loaded, call initialize or resume first",
    )
}

fn evidence_ids(evidence: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    if let Some(id) = evidence.get("evidence_id").and_then(Value::as_str) {
        ids.push(id.to_string());
    }
    if let Some(list) = evidence.get("evidence_ids").and_then(Value::as_array) {
        ids.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
    }
    ids
}
