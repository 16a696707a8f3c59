//! Session model: one orchestration run through the seven phases.
//!
//! A [`Session`] is mutated only by the lifecycle controller and persisted
//! through a [`SessionStore`] after every mutation. Its overall status is
//! derived from four terminal flags and phase completion; nothing sets the
//! status directly.

pub mod store;

pub use store::{ExecutorRun, FileSessionStore, MemorySessionStore, SessionGuard, SessionStore};

use crate::continuation::ContinuationState;
use crate::errors::{CoreError, CoreResult, ErrorKind, SessionEffect};
use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Derived status of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    /// No flag raised and work remains.
    InProgress,
    Incomplete,
    NoEvidence,
    Error,
    Invalid,
    Complete,
}

impl OverallStatus {
    /// Terminal sessions accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OverallStatus::Complete | OverallStatus::Error | OverallStatus::Invalid
        )
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallStatus::InProgress => "IN_PROGRESS",
            OverallStatus::Incomplete => "INCOMPLETE",
            OverallStatus::NoEvidence => "NO_EVIDENCE",
            OverallStatus::Error => "ERROR",
            OverallStatus::Invalid => "INVALID",
            OverallStatus::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

/// Bookkeeping for one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

impl PhaseRecord {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: 0,
            timeout_secs: None,
            last_failure: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated
        )
    }
}

/// Bookkeeping for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub phase: Phase,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn new(task_id: &str, phase: Phase) -> Self {
        Self {
            task_id: task_id.to_string(),
            phase,
            status: TaskStatus::Pending,
            attempts: 0,
            evidence_ids: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            last_error: None,
        }
    }
}

/// The four terminal flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    pub error: bool,
    pub invalid: bool,
    pub no_evidence: bool,
    pub incomplete: bool,
}

/// An error that reached the session boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    pub at: DateTime<Utc>,
}

/// One orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    current_phase: Phase,
    phases: Vec<PhaseRecord>,
    phases_completed: Vec<Phase>,
    #[serde(default)]
    tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    active_parallel_tasks: BTreeSet<String>,
    #[serde(default)]
    flags: SessionFlags,
    #[serde(default)]
    explicit_approval: bool,
    #[serde(default)]
    continuation_in_progress: bool,
    #[serde(default)]
    errors: Vec<SessionError>,
}

impl Session {
    /// A fresh session positioned at the first phase with all status cleared.
    pub fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            updated_at: now,
            current_phase: Phase::first(),
            phases: Phase::ALL.iter().map(|p| PhaseRecord::new(*p)).collect(),
            phases_completed: Vec::new(),
            tasks: BTreeMap::new(),
            active_parallel_tasks: BTreeSet::new(),
            flags: SessionFlags::default(),
            explicit_approval: false,
            continuation_in_progress: false,
            errors: Vec::new(),
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    /// Reject a loaded snapshot whose phase bookkeeping does not match the
    /// fixed phase order. Run before a snapshot replaces live state.
    pub fn check_consistency(&self) -> CoreResult<()> {
        let inconsistent = |problem: String| {
            CoreError::new(
                ErrorKind::Serialization,
                format!("session {} snapshot is inconsistent: {}", self.session_id, problem),
            )
            .with_detail("session_id", &self.session_id)
        };
        if self.phases.len() != Phase::ALL.len() {
            return Err(inconsistent(format!(
                "{} phase records, expected {}",
                self.phases.len(),
                Phase::ALL.len()
            )));
        }
        if let Some((record, expected)) = self
            .phases
            .iter()
            .zip(Phase::ALL.iter())
            .find(|(record, expected)| record.phase != **expected)
        {
            return Err(inconsistent(format!(
                "phase record {} where {} belongs",
                record.phase, expected
            )));
        }
        let distinct: BTreeSet<usize> = self.phases_completed.iter().map(Phase::index).collect();
        if distinct.len() != self.phases_completed.len() {
            return Err(inconsistent("phase completed twice".to_string()));
        }
        Ok(())
    }

    pub fn phase_record(&self, phase: Phase) -> &PhaseRecord {
        &self.phases[phase.index()]
    }

    pub(crate) fn phase_record_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        &mut self.phases[phase.index()]
    }

    pub fn phases_completed(&self) -> &[Phase] {
        &self.phases_completed
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskRecord> {
        &self.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub(crate) fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskRecord> {
        self.tasks.get_mut(task_id)
    }

    pub(crate) fn insert_task(&mut self, record: TaskRecord) {
        self.tasks.insert(record.task_id.clone(), record);
    }

    pub fn active_parallel_tasks(&self) -> &BTreeSet<String> {
        &self.active_parallel_tasks
    }

    pub(crate) fn active_parallel_tasks_mut(&mut self) -> &mut BTreeSet<String> {
        &mut self.active_parallel_tasks
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn explicit_approval(&self) -> bool {
        self.explicit_approval
    }

    pub fn continuation_in_progress(&self) -> bool {
        self.continuation_in_progress
    }

    pub fn errors(&self) -> &[SessionError] {
        &self.errors
    }

    /// Derived status. Priority: INVALID > ERROR > NO_EVIDENCE > INCOMPLETE > COMPLETE.
    pub fn overall_status(&self) -> OverallStatus {
        if self.flags.invalid {
            OverallStatus::Invalid
        } else if self.flags.error {
            OverallStatus::Error
        } else if self.flags.no_evidence {
            OverallStatus::NoEvidence
        } else if self.flags.incomplete {
            OverallStatus::Incomplete
        } else if self.all_phases_completed() {
            OverallStatus::Complete
        } else {
            OverallStatus::InProgress
        }
    }

    pub fn all_phases_completed(&self) -> bool {
        self.phases_completed.len() == Phase::ALL.len()
    }

    /// Phases and tasks not yet finished.
    pub fn remaining_work(&self) -> usize {
        let phases = Phase::ALL.len().saturating_sub(self.phases_completed.len());
        let tasks = self
            .tasks
            .values()
            .filter(|t| t.status != TaskStatus::Completed)
            .count();
        phases + tasks
    }

    /// Fraction of phases completed.
    pub fn progress(&self) -> f64 {
        self.phases_completed.len() as f64 / Phase::ALL.len() as f64
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn set_current_phase(&mut self, phase: Phase) {
        self.current_phase = phase;
    }

    /// Append to `phases_completed`; the list never shrinks.
    pub(crate) fn push_completed(&mut self, phase: Phase) {
        if !self.phases_completed.contains(&phase) {
            self.phases_completed.push(phase);
        }
    }

    pub(crate) fn mark_error(&mut self) {
        self.flags.error = true;
    }

    pub(crate) fn mark_invalid(&mut self) {
        self.flags.invalid = true;
    }

    pub(crate) fn mark_no_evidence(&mut self) {
        self.flags.no_evidence = true;
    }

    /// Enter an incomplete checkpoint. Any earlier approval is dropped; the
    /// checkpoint needs its own.
    pub(crate) fn mark_incomplete(&mut self) {
        self.flags.incomplete = true;
        self.explicit_approval = false;
    }

    /// Leave an incomplete checkpoint; consumes the approval.
    pub(crate) fn clear_incomplete(&mut self) {
        self.flags.incomplete = false;
        self.explicit_approval = false;
        self.continuation_in_progress = false;
    }

    pub(crate) fn set_explicit_approval(&mut self, approved: bool) {
        self.explicit_approval = approved;
    }

    pub(crate) fn set_continuation_in_progress(&mut self, in_progress: bool) {
        self.continuation_in_progress = in_progress;
    }

    /// Raise the flag a surfaced error forces and remember the error.
    pub(crate) fn apply_error(&mut self, phase: Option<Phase>, err: &CoreError) {
        match err.kind().session_effect() {
            SessionEffect::Error => self.mark_error(),
            SessionEffect::Invalid => self.mark_invalid(),
            SessionEffect::NoEvidence => self.mark_no_evidence(),
            SessionEffect::None => {}
        }
        self.errors.push(SessionError {
            code: err.code().to_string(),
            message: err.message().to_string(),
            phase,
            at: Utc::now(),
        });
    }

    /// Projection read by continuation control.
    pub fn continuation_state(&self) -> ContinuationState {
        ContinuationState {
            session_id: self.session_id.clone(),
            status: self.overall_status(),
            explicit_approval: self.explicit_approval,
            continuation_in_progress: self.continuation_in_progress,
            remaining_work: self.remaining_work(),
            progress: self.progress(),
            evidence_valid: !self.flags.no_evidence,
            critical_errors: usize::from(self.flags.error),
        }
    }
}
