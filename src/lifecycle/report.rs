use crate::phase::Phase;
use crate::session::{OverallStatus, PhaseStatus, Session, SessionError, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub name: String,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
}

/// Summary written to `report.json` when a session is wrapped up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub session_id: String,
    pub generated_at: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub current_phase: Phase,
    pub phases_completed: Vec<Phase>,
    pub phases: Vec<PhaseTiming>,
    /// Sum of recorded phase durations.
    pub total_duration_ms: i64,
    pub tasks: TaskCounts,
    pub executor_runs: usize,
    #[serde(default)]
    pub errors: Vec<SessionError>,
}

impl FinalReport {
    pub fn from_session(session: &Session, executor_runs: usize) -> Self {
        let phases: Vec<PhaseTiming> = session
            .phases()
            .iter()
            .map(|r| PhaseTiming {
                phase: r.phase,
                name: r.phase.name().to_string(),
                status: r.status,
                started_at: r.started_at,
                completed_at: r.completed_at,
                duration_ms: r.duration_ms,
                retry_count: r.retry_count,
            })
            .collect();

        let mut tasks = TaskCounts::default();
        for task in session.tasks().values() {
            tasks.total += 1;
            match task.status {
                TaskStatus::Pending => tasks.pending += 1,
                TaskStatus::InProgress => tasks.in_progress += 1,
                TaskStatus::Completed => tasks.completed += 1,
                TaskStatus::Failed => tasks.failed += 1,
                TaskStatus::Escalated => tasks.escalated += 1,
            }
        }

        Self {
            session_id: session.session_id.clone(),
            generated_at: Utc::now(),
            overall_status: session.overall_status(),
            current_phase: session.current_phase(),
            phases_completed: session.phases_completed().to_vec(),
            total_duration_ms: phases.iter().filter_map(|p| p.duration_ms).sum(),
            phases,
            tasks,
            executor_runs,
            errors: session.errors().to_vec(),
        }
    }
}
