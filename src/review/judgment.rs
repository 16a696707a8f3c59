use super::criteria::{Candidate, CriterionResult, evaluate_all};
use crate::config::PhasegateConfig;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use tracing::{info, warn};

static TRANSIENT_FAILURE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\btimed?\s*out\b|\btimeout\b|\brate[\s_-]?limit(?:ed)?\b|\btoo many requests\b|\boverloaded\b|\bconnection (?:reset|refused|closed)\b|\beconnreset\b|\b(?:temporarily|service) unavailable\b|\bbad gateway\b|\b5\d\d\b",
    )
    .unwrap()
});

/// Whether an executor failure message describes a transient condition worth
/// retrying unchanged.
pub fn is_transient_failure(message: &str) -> bool {
    TRANSIENT_FAILURE_REGEX.is_match(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Reject,
    Retry,
    Escalate,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Reject => write!(f, "REJECT"),
            Verdict::Retry => write!(f, "RETRY"),
            Verdict::Escalate => write!(f, "ESCALATE"),
        }
    }
}

/// One judgment of one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub task_id: String,
    /// 1-based count of judgments for this task, this one included.
    pub iteration: u32,
    pub verdict: Verdict,
    pub criteria: Vec<CriterionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification_instruction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub judged_at: DateTime<Utc>,
}

impl Judgment {
    pub fn failed_criteria(&self) -> impl Iterator<Item = &CriterionResult> {
        self.criteria.iter().filter(|c| !c.passed)
    }

    pub fn is_pass(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Build the instruction sent back to the executor after a rejection.
pub fn modification_instruction(failed: &[&CriterionResult]) -> String {
    let mut out = String::from("The previous attempt was rejected. Revise it to fix:\n");
    for result in failed {
        out.push_str(&format!("- {} ({}): {}", result.id, result.label, result.id.remedy()));
        if let Some(ref detail) = result.detail {
            out.push_str(&format!(" [{}]", detail));
        }
        out.push('\n');
    }
    out
}

/// Bounded judgment loop.
///
/// Tracks how many times each task has been judged. Once the count exceeds
/// `max_iterations`, the verdict is ESCALATE whatever the criteria say.
#[derive(Debug)]
pub struct ReviewLoop {
    max_iterations: u32,
    iterations: HashMap<String, u32>,
}

impl ReviewLoop {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            iterations: HashMap::new(),
        }
    }

    pub fn from_config(config: &PhasegateConfig) -> Self {
        Self::new(config.review.max_iterations)
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn iteration(&self, task_id: &str) -> u32 {
        self.iterations.get(task_id).copied().unwrap_or(0)
    }

    /// Forget a task's count, e.g. once it has passed.
    pub fn reset(&mut self, task_id: &str) {
        self.iterations.remove(task_id);
    }

    fn next_iteration(&mut self, task_id: &str) -> u32 {
        let count = self.iterations.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn exceeded(&self, iteration: u32) -> bool {
        iteration > self.max_iterations
    }

    /// Judge a delivered candidate.
    pub fn judge(&mut self, task_id: &str, candidate: &Candidate) -> Judgment {
        let iteration = self.next_iteration(task_id);
        let criteria = evaluate_all(candidate);
        let failed: Vec<&CriterionResult> = criteria.iter().filter(|c| !c.passed).collect();

        let (verdict, instruction, reason) = if self.exceeded(iteration) {
            (
                Verdict::Escalate,
                None,
                Some(format!(
                    "iteration {} exceeds the limit of {}",
                    iteration, self.max_iterations
                )),
            )
        } else if failed.is_empty() {
            (Verdict::Pass, None, None)
        } else {
            (Verdict::Reject, Some(modification_instruction(&failed)), None)
        };

        let failed_ids: Vec<String> = failed.iter().map(|c| c.id.to_string()).collect();
        match verdict {
            Verdict::Escalate => warn!(task = task_id, iteration, "review escalated"),
            _ => info!(task = task_id, iteration, verdict = %verdict, failed = ?failed_ids, "review judged"),
        }

        Judgment {
            task_id: task_id.to_string(),
            iteration,
            verdict,
            criteria,
            modification_instruction: instruction,
            reason,
            judged_at: Utc::now(),
        }
    }

    /// Judge an attempt that never produced a candidate because the executor
    /// failed. Transient failures yield RETRY; anything else, or a transient
    /// failure past the iteration limit, yields ESCALATE.
    pub fn judge_failure(&mut self, task_id: &str, message: &str) -> Judgment {
        let iteration = self.next_iteration(task_id);
        let verdict = if !self.exceeded(iteration) && is_transient_failure(message) {
            Verdict::Retry
        } else {
            Verdict::Escalate
        };
        warn!(task = task_id, iteration, verdict = %verdict, error = message, "executor attempt failed");
        Judgment {
            task_id: task_id.to_string(),
            iteration,
            verdict,
            criteria: Vec::new(),
            modification_instruction: None,
            reason: Some(message.to_string()),
            judged_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::CriterionId;

    fn clean() -> Candidate {
        Candidate::new()
            .with_file("src/a.rs", "fn a() {}\n")
            .require("src/a.rs")
            .with_evidence("ev-1")
            .with_response("done")
    }

    #[test]
    fn test_clean_candidate_passes() {
        let mut review = ReviewLoop::new(3);
        let j = review.judge("t1", &clean());
        assert_eq!(j.verdict, Verdict::Pass);
        assert_eq!(j.iteration, 1);
        assert_eq!(j.criteria.len(), 6);
        assert!(j.modification_instruction.is_none());
    }

    #[test]
    fn test_rest_omitted_rejected_with_instruction() {
        let mut review = ReviewLoop::new(3);
        let candidate = clean().with_file("src/b.rs", "fn b() {}\n// rest omitted\n");
        let j = review.judge("t1", &candidate);
        assert_eq!(j.verdict, Verdict::Reject);
        let failed: Vec<CriterionId> = j.failed_criteria().map(|c| c.id).collect();
        assert_eq!(failed, vec![CriterionId::Q3]);
        let instruction = j.modification_instruction.unwrap();
        assert!(instruction.contains("Q3 (no omission markers)"));
        assert!(!instruction.contains("Q1"));
    }

    #[test]
    fn test_escalates_past_limit_regardless_of_criteria() {
        let mut review = ReviewLoop::new(2);
        let bad = Candidate::new().with_response("I'll stop here");
        assert_eq!(review.judge("t1", &bad).verdict, Verdict::Reject);
        assert_eq!(review.judge("t1", &bad).verdict, Verdict::Reject);
        let j = review.judge("t1", &clean());
        assert_eq!(j.verdict, Verdict::Escalate);
        assert_eq!(j.iteration, 3);
        // other tasks are counted separately
        assert_eq!(review.judge("t2", &clean()).verdict, Verdict::Pass);
    }

    #[test]
    fn test_reset_clears_count() {
        let mut review = ReviewLoop::new(1);
        review.judge("t1", &clean());
        review.reset("t1");
        assert_eq!(review.iteration("t1"), 0);
        assert_eq!(review.judge("t1", &clean()).verdict, Verdict::Pass);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient_failure("request timed out after 30s"));
        assert!(is_transient_failure("429 Too Many Requests"));
        assert!(is_transient_failure("HTTP 503 Service Unavailable"));
        assert!(is_transient_failure("Connection reset by peer"));
        assert!(is_transient_failure("rate_limited"));
        assert!(!is_transient_failure("invalid API key"));
        assert!(!is_transient_failure("exit status 1"));
    }

    #[test]
    fn test_judge_failure_verdicts() {
        let mut review = ReviewLoop::new(1);
        assert_eq!(review.judge_failure("t1", "timeout").verdict, Verdict::Retry);
        assert_eq!(review.judge_failure("t1", "timeout").verdict, Verdict::Escalate);
        assert_eq!(
            review.judge_failure("t2", "malformed request").verdict,
            Verdict::Escalate
        );
    }

    #[test]
    fn test_verdict_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Verdict::Escalate).unwrap(), "\"ESCALATE\"");
        assert_eq!(Verdict::Reject.to_string(), "REJECT");
    }
}
