//! Continuation control: whether a session may keep progressing.
//!
//! A session that reached an incomplete checkpoint never auto-progresses.
//! It needs a continuation request, an explicit approval of that request,
//! and a clean bill from [`validate_continuation_conditions`]. The pure
//! function [`determine_next_action`] combines these into one decision and is
//! the only authority the lifecycle controller consults before advancing past
//! an incomplete point.

use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::session::OverallStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// The slice of session state continuation decisions read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationState {
    pub session_id: String,
    pub status: OverallStatus,
    pub explicit_approval: bool,
    pub continuation_in_progress: bool,
    pub remaining_work: usize,
    /// Fraction of phases completed, 0.0 to 1.0
    pub progress: f64,
    pub evidence_valid: bool,
    pub critical_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// A request to keep a session going past an incomplete checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationRequest {
    pub request_id: String,
    pub session_id: String,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Conditions checked before continuing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum ConditionFailure {
    MinimumProgress { required: f64, actual: f64 },
    EvidenceInvalid,
    CriticalErrors { count: usize },
}

impl ConditionFailure {
    pub fn describe(&self) -> String {
        match self {
            ConditionFailure::MinimumProgress { required, actual } => format!(
                "progress {:.0}% is below the required {:.0}%",
                actual * 100.0,
                required * 100.0
            ),
            ConditionFailure::EvidenceInvalid => "evidence is missing or invalid".to_string(),
            ConditionFailure::CriticalErrors { count } => {
                format!("{} critical error(s) recorded", count)
            }
        }
    }
}

/// Outcome of [`determine_next_action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextAction {
    pub proceed: bool,
    pub reason: String,
}

impl NextAction {
    fn proceed(reason: impl Into<String>) -> Self {
        Self {
            proceed: true,
            reason: reason.into(),
        }
    }

    fn halt(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: reason.into(),
        }
    }
}

/// Check minimum progress, evidence validity and absence of critical errors.
pub fn validate_continuation_conditions(
    state: &ContinuationState,
    min_progress: f64,
) -> Vec<ConditionFailure> {
    let mut failures = Vec::new();
    if state.progress < min_progress {
        failures.push(ConditionFailure::MinimumProgress {
            required: min_progress,
            actual: state.progress,
        });
    }
    if !state.evidence_valid {
        failures.push(ConditionFailure::EvidenceInvalid);
    }
    if state.critical_errors > 0 {
        failures.push(ConditionFailure::CriticalErrors {
            count: state.critical_errors,
        });
    }
    failures
}

/// Pure decision: may the session advance?
pub fn determine_next_action(state: &ContinuationState, min_progress: f64) -> NextAction {
    match state.status {
        OverallStatus::Invalid => NextAction::halt("session is INVALID"),
        OverallStatus::Error => NextAction::halt("session is in ERROR and needs operator attention"),
        OverallStatus::NoEvidence => NextAction::halt("session has NO_EVIDENCE"),
        OverallStatus::Complete => NextAction::proceed("session is COMPLETE"),
        OverallStatus::InProgress => NextAction::proceed("no checkpoint pending"),
        OverallStatus::Incomplete => {
            if !state.explicit_approval {
                return NextAction::halt("incomplete checkpoint requires explicit approval");
            }
            let failures = validate_continuation_conditions(state, min_progress);
            if failures.is_empty() {
                NextAction::proceed("continuation approved and all conditions hold")
            } else {
                let reasons: Vec<String> = failures.iter().map(|f| f.describe()).collect();
                NextAction::halt(format!(
                    "continuation approved but conditions failed: {}",
                    reasons.join("; ")
                ))
            }
        }
    }
}

/// Quick gate: false for ERROR, NO_EVIDENCE and INVALID; INCOMPLETE needs approval.
pub fn can_continue(state: &ContinuationState) -> bool {
    match state.status {
        OverallStatus::Error | OverallStatus::NoEvidence | OverallStatus::Invalid => false,
        OverallStatus::Incomplete => state.explicit_approval,
        OverallStatus::InProgress | OverallStatus::Complete => true,
    }
}

/// Keeps continuation requests and approvals with timestamps.
#[derive(Debug)]
pub struct ContinuationController {
    requests: BTreeMap<String, ContinuationRequest>,
    request_timeout: Duration,
    min_progress: f64,
}

impl ContinuationController {
    pub fn new(request_timeout: Duration, min_progress: f64) -> Self {
        Self {
            requests: BTreeMap::new(),
            request_timeout,
            min_progress,
        }
    }

    pub fn min_progress(&self) -> f64 {
        self.min_progress
    }

    pub fn can_continue(&self, state: &ContinuationState) -> bool {
        can_continue(state)
    }

    pub fn validate_continuation_conditions(
        &self,
        state: &ContinuationState,
    ) -> Vec<ConditionFailure> {
        validate_continuation_conditions(state, self.min_progress)
    }

    pub fn determine_next_action(&self, state: &ContinuationState) -> NextAction {
        determine_next_action(state, self.min_progress)
    }

    fn pending_for(&self, session_id: &str) -> Option<&ContinuationRequest> {
        self.requests
            .values()
            .find(|r| r.session_id == session_id && r.status == RequestStatus::Pending)
    }

    fn rejection(state: &ContinuationState, reason: &str) -> CoreError {
        warn!(session = %state.session_id, reason, "continuation request rejected");
        CoreError::new(
            ErrorKind::ContinuationRejected,
            format!("continuation rejected: {}", reason),
        )
        .with_detail("session_id", &state.session_id)
        .with_detail("status", state.status.to_string())
        .with_detail("remaining_work", state.remaining_work)
    }

    /// Open a pending request. Meaningless or duplicate requests are refused.
    pub fn request_continuation(
        &mut self,
        state: &ContinuationState,
    ) -> CoreResult<ContinuationRequest> {
        if state.status == OverallStatus::Complete {
            return Err(Self::rejection(
                state,
                "no remaining work, session is already COMPLETE",
            ));
        }
        if state.remaining_work == 0 {
            return Err(Self::rejection(state, "no remaining work"));
        }
        if state.status == OverallStatus::Invalid {
            return Err(Self::rejection(state, "session is INVALID"));
        }
        if state.continuation_in_progress || self.pending_for(&state.session_id).is_some() {
            return Err(Self::rejection(
                state,
                "a continuation request is already in flight",
            ));
        }

        let request = ContinuationRequest {
            request_id: Uuid::new_v4().to_string(),
            session_id: state.session_id.clone(),
            status: RequestStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            approver: None,
            reason: None,
        };
        info!(session = %state.session_id, request = %request.request_id, "continuation requested");
        self.requests
            .insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    fn resolve(
        &mut self,
        session_id: &str,
        status: RequestStatus,
        approver: Option<&str>,
        reason: Option<&str>,
    ) -> CoreResult<ContinuationRequest> {
        let request = self
            .requests
            .values_mut()
            .find(|r| r.session_id == session_id && r.status == RequestStatus::Pending)
            .ok_or_else(|| {
                CoreError::new(
                    ErrorKind::ContinuationNotFound,
                    format!("no pending continuation request for session {}", session_id),
                )
                .with_detail("session_id", session_id)
            })?;
        request.status = status;
        request.resolved_at = Some(Utc::now());
        request.approver = approver.map(str::to_string);
        request.reason = reason.map(str::to_string);
        Ok(request.clone())
    }

    /// Record an explicit approval for the session's pending request.
    pub fn approve(&mut self, session_id: &str, approver: &str) -> CoreResult<ContinuationRequest> {
        let request = self.resolve(session_id, RequestStatus::Approved, Some(approver), None)?;
        info!(session = session_id, approver, "continuation approved");
        Ok(request)
    }

    pub fn reject(&mut self, session_id: &str, reason: &str) -> CoreResult<ContinuationRequest> {
        let request = self.resolve(session_id, RequestStatus::Rejected, None, Some(reason))?;
        info!(session = session_id, reason, "continuation rejected by operator");
        Ok(request)
    }

    /// Move pending requests older than the timeout to expired.
    pub fn expire_stale_requests(&mut self, now: DateTime<Utc>) -> Vec<ContinuationRequest> {
        let timeout = chrono::Duration::from_std(self.request_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let mut expired = Vec::new();
        for request in self.requests.values_mut() {
            if request.status == RequestStatus::Pending && now - request.requested_at > timeout {
                request.status = RequestStatus::Expired;
                request.resolved_at = Some(now);
                request.reason = Some("request timed out".to_string());
                warn!(session = %request.session_id, request = %request.request_id, "continuation request expired");
                expired.push(request.clone());
            }
        }
        expired
    }

    /// Every request recorded for a session, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<&ContinuationRequest> {
        let mut history: Vec<&ContinuationRequest> = self
            .requests
            .values()
            .filter(|r| r.session_id == session_id)
            .collect();
        history.sort_by_key(|r| r.requested_at);
        history
    }

    pub fn pending_request(&self, session_id: &str) -> Option<&ContinuationRequest> {
        self.pending_for(session_id)
    }
}
