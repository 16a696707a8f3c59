//! Evidence gates checked before a phase may complete.
//!
//! Each phase names the evidence fields that must be present. A field is
//! present when it exists and is not null, an empty string, an empty array or
//! an empty object. Missing or partial evidence fails the gate.

use crate::errors::{CoreError, CoreResult, ErrorKind};
use crate::phase::Phase;
use crate::session::{Session, TaskStatus};
use serde_json::Value;

/// Fields the evidence object must carry for `phase`.
pub fn required_fields(phase: Phase) -> &'static [&'static str] {
    match phase {
        Phase::RequirementAnalysis => &["requirements"],
        Phase::TaskDecomposition => &["tasks"],
        Phase::Planning => &["plan"],
        Phase::Execution => &["evidence_ids"],
        Phase::Qa => &["review_verdict"],
        Phase::CompletionValidation => &["integrity_verified"],
        Phase::Report => &["report_path"],
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Result of a gate evaluation that did not pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateFailure {
    pub missing_fields: Vec<String>,
    pub reasons: Vec<String>,
}

impl GateFailure {
    fn is_empty(&self) -> bool {
        self.missing_fields.is_empty() && self.reasons.is_empty()
    }
}

/// Evaluate the gate for `phase` without touching the session.
pub fn evaluate(phase: Phase, evidence: Option<&Value>, session: &Session) -> GateFailure {
    let mut failure = GateFailure::default();

    let object = match evidence {
        Some(Value::Object(map)) => Some(map),
        Some(Value::Null) | None => {
            failure.reasons.push("no evidence supplied".to_string());
            None
        }
        Some(_) => {
            failure
                .reasons
                .push("evidence must be a JSON object".to_string());
            None
        }
    };

    for field in required_fields(phase) {
        if !is_present(object.and_then(|o| o.get(*field))) {
            failure.missing_fields.push((*field).to_string());
        }
    }

    if let Some(map) = object {
        match phase {
            Phase::Qa => {
                match map.get("review_verdict") {
                    Some(Value::String(verdict)) if !verdict.eq_ignore_ascii_case("pass") => {
                        failure
                            .reasons
                            .push(format!("review verdict is {}, expected pass", verdict));
                    }
                    Some(other) if !other.is_string() && is_present(Some(other)) => {
                        failure
                            .reasons
                            .push("review_verdict must be a string".to_string());
                    }
                    _ => {}
                }
            }
            Phase::CompletionValidation => {
                if map.get("integrity_verified").and_then(Value::as_bool) != Some(true)
                    && is_present(map.get("integrity_verified"))
                {
                    failure
                        .reasons
                        .push("integrity_verified must be true".to_string());
                }
            }
            _ => {}
        }
    }

    if phase == Phase::Execution {
        let active = session.active_parallel_tasks();
        if !active.is_empty() {
            failure.reasons.push(format!(
                "{} parallel task(s) still active: {}",
                active.len(),
                active.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }
        let failed: Vec<&str> = session
            .tasks()
            .values()
            .filter(|t| t.phase == Phase::Execution && t.status == TaskStatus::Failed)
            .map(|t| t.task_id.as_str())
            .collect();
        if !failed.is_empty() {
            failure
                .reasons
                .push(format!("failed task(s): {}", failed.join(", ")));
        }
    }

    failure
}

/// Check the gate and turn a failure into a typed error.
pub fn check(phase: Phase, evidence: Option<&Value>, session: &Session) -> CoreResult<()> {
    let failure = evaluate(phase, evidence, session);
    if failure.is_empty() {
        return Ok(());
    }
    let mut summary = Vec::new();
    if !failure.missing_fields.is_empty() {
        summary.push(format!("missing {}", failure.missing_fields.join(", ")));
    }
    summary.extend(failure.reasons.iter().cloned());
    Err(CoreError::new(
        ErrorKind::GateFailed,
        format!("gate for phase {} failed: {}", phase, summary.join("; ")),
    )
    .with_detail("phase", phase.slug())
    .with_detail("session_id", &session.session_id)
    .with_detail("missing_fields", &failure.missing_fields)
    .with_detail("reasons", &failure.reasons))
}
