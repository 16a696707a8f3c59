//! Typed error for the phasegate core.
//!
//! Every failure the core surfaces is a [`CoreError`]: a stable [`ErrorKind`]
//! plus a structured detail payload naming the resource, session and counts
//! involved. Callers match on the kind; operators read the code and details.
//!
//! Kinds are grouped into [`ErrorCategory`] values that decide what a
//! surfaced error forces on the owning session (see
//! [`ErrorKind::session_effect`]).

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the library.
pub type CoreResult<T> = Result<T, CoreError>;

/// Where an error originates. Mirrors the error groups of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Lifecycle,
    Evidence,
    Locking,
    Pool,
    Continuation,
    Review,
    Executor,
    Persistence,
}

/// Flag a surfaced error forces onto the session, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEffect {
    None,
    Error,
    Invalid,
    NoEvidence,
}

/// Closed set of failure kinds. Codes are stable and safe to persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Configuration
    Configuration,
    // Lifecycle
    InvalidTransition,
    GateFailed,
    PhaseRetryable,
    RetryExhausted,
    PhaseTimedOut,
    CriticalFailure,
    SessionHalted,
    SessionNotInitialized,
    TaskNotActive,
    // Locking
    LockConflict,
    SemaphoreExhausted,
    Deadlock,
    LockNotHeld,
    AutoReleaseForbidden,
    // Pools
    CapacityExceeded,
    SlotNotFound,
    TaskInProgress,
    NoTaskAssigned,
    PermissionDenied,
    MissingEvidence,
    // Evidence
    NonAtomicEvidence,
    AggregatedEvidence,
    IntegrityViolation,
    EvidenceNotFound,
    DuplicateEvidence,
    EvidenceSessionFinalized,
    EvidenceSessionNotInitialized,
    // Continuation
    ContinuationRejected,
    ContinuationNotFound,
    // Review
    ReviewEscalated,
    // Executor
    ExecutorFailure,
    // Persistence
    Io,
    Serialization,
    StatePoisoned,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION_INVALID",
            ErrorKind::InvalidTransition => "LIFECYCLE_INVALID_TRANSITION",
            ErrorKind::GateFailed => "LIFECYCLE_GATE_FAILED",
            ErrorKind::PhaseRetryable => "LIFECYCLE_PHASE_RETRYABLE",
            ErrorKind::RetryExhausted => "LIFECYCLE_RETRY_EXHAUSTED",
            ErrorKind::PhaseTimedOut => "LIFECYCLE_PHASE_TIMED_OUT",
            ErrorKind::CriticalFailure => "LIFECYCLE_CRITICAL_FAILURE",
            ErrorKind::SessionHalted => "LIFECYCLE_SESSION_HALTED",
            ErrorKind::SessionNotInitialized => "LIFECYCLE_SESSION_NOT_INITIALIZED",
            ErrorKind::TaskNotActive => "LIFECYCLE_TASK_NOT_ACTIVE",
            ErrorKind::LockConflict => "LOCK_CONFLICT",
            ErrorKind::SemaphoreExhausted => "LOCK_SEMAPHORE_EXHAUSTED",
            ErrorKind::Deadlock => "LOCK_DEADLOCK_DETECTED",
            ErrorKind::LockNotHeld => "LOCK_NOT_HELD",
            ErrorKind::AutoReleaseForbidden => "LOCK_AUTO_RELEASE_FORBIDDEN",
            ErrorKind::CapacityExceeded => "POOL_CAPACITY_EXCEEDED",
            ErrorKind::SlotNotFound => "POOL_SLOT_NOT_FOUND",
            ErrorKind::TaskInProgress => "POOL_TASK_IN_PROGRESS",
            ErrorKind::NoTaskAssigned => "POOL_NO_TASK_ASSIGNED",
            ErrorKind::PermissionDenied => "POOL_PERMISSION_DENIED",
            ErrorKind::MissingEvidence => "POOL_MISSING_EVIDENCE",
            ErrorKind::NonAtomicEvidence => "EVIDENCE_NOT_ATOMIC",
            ErrorKind::AggregatedEvidence => "EVIDENCE_AGGREGATED",
            ErrorKind::IntegrityViolation => "EVIDENCE_INTEGRITY_VIOLATION",
            ErrorKind::EvidenceNotFound => "EVIDENCE_NOT_FOUND",
            ErrorKind::DuplicateEvidence => "EVIDENCE_DUPLICATE",
            ErrorKind::EvidenceSessionFinalized => "EVIDENCE_SESSION_FINALIZED",
            ErrorKind::EvidenceSessionNotInitialized => "EVIDENCE_SESSION_NOT_INITIALIZED",
            ErrorKind::ContinuationRejected => "CONTINUATION_REJECTED",
            ErrorKind::ContinuationNotFound => "CONTINUATION_NOT_FOUND",
            ErrorKind::ReviewEscalated => "REVIEW_ESCALATED",
            ErrorKind::ExecutorFailure => "EXECUTOR_FAILURE",
            ErrorKind::Io => "PERSISTENCE_IO",
            ErrorKind::Serialization => "PERSISTENCE_SERIALIZATION",
            ErrorKind::StatePoisoned => "PERSISTENCE_STATE_POISONED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            Configuration => ErrorCategory::Configuration,
            InvalidTransition | GateFailed | PhaseRetryable | RetryExhausted | PhaseTimedOut
            | CriticalFailure | SessionHalted | SessionNotInitialized | TaskNotActive => {
                ErrorCategory::Lifecycle
            }
            LockConflict | SemaphoreExhausted | Deadlock | LockNotHeld | AutoReleaseForbidden => {
                ErrorCategory::Locking
            }
            CapacityExceeded | SlotNotFound | TaskInProgress | NoTaskAssigned
            | PermissionDenied | MissingEvidence => ErrorCategory::Pool,
            NonAtomicEvidence | AggregatedEvidence | IntegrityViolation | EvidenceNotFound
            | DuplicateEvidence | EvidenceSessionFinalized | EvidenceSessionNotInitialized => {
                ErrorCategory::Evidence
            }
            ContinuationRejected | ContinuationNotFound => ErrorCategory::Continuation,
            ReviewEscalated => ErrorCategory::Review,
            ExecutorFailure => ErrorCategory::Executor,
            Io | Serialization | StatePoisoned => ErrorCategory::Persistence,
        }
    }

    /// What a surfaced error of this kind forces on the session.
    ///
    /// Locking and pool errors deny the operation and nothing more; the caller
    /// decides whether to retry, reorder or abort.
    pub fn session_effect(&self) -> SessionEffect {
        match self {
            ErrorKind::CriticalFailure | ErrorKind::RetryExhausted => SessionEffect::Error,
            ErrorKind::ExecutorFailure => SessionEffect::Invalid,
            _ if self.category() == ErrorCategory::Evidence => SessionEffect::NoEvidence,
            ErrorKind::MissingEvidence => SessionEffect::NoEvidence,
            _ => SessionEffect::None,
        }
    }

    /// Recoverable kinds are handled locally and retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::LockConflict
                | ErrorKind::SemaphoreExhausted
                | ErrorKind::PhaseRetryable
                | ErrorKind::PhaseTimedOut
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The single error type of the core.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    details: BTreeMap<String, Value>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attach a structured detail. Values that fail to serialize are stored as null.
    pub fn with_detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    pub fn io(context: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, format!("{context}: {source}"))
            .with_detail("path", path.display().to_string())
            .with_detail("io_kind", format!("{:?}", source.kind()))
    }

    pub fn serialization(context: &str, source: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("{context}: {source}"))
    }

    pub fn poisoned(component: &str) -> Self {
        Self::new(
            ErrorKind::StatePoisoned,
            format!("{component} state lock poisoned"),
        )
        .with_detail("component", component)
    }
}

/// JSON view used when errors are written to run logs and reports.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub message: String,
    pub details: BTreeMap<String, Value>,
}

impl From<&CoreError> for ErrorRecord {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.code(),
            category: err.kind.category(),
            message: err.message.clone(),
            details: err.details.clone(),
        }
    }
}
