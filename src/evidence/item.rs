use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One file produced or touched by an operation, with the content captured
/// at the time the evidence was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub content: String,
}

impl Artifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Proof that one operation produced specific artifacts.
///
/// Items are written once and never modified. `atomic_operation` must be true
/// and `aggregated` false for the ledger to accept the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub session_id: String,
    pub operation_id: String,
    pub operation_type: String,
    pub atomic_operation: bool,
    #[serde(default)]
    pub aggregated: bool,
    pub artifacts: Vec<Artifact>,
    /// Lowercase hex SHA-256 over the artifacts.
    pub content_hash: String,
    #[serde(default)]
    pub raw_log_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EvidenceItem {
    /// A fresh atomic item with its hash computed.
    pub fn new(
        session_id: &str,
        operation_id: &str,
        operation_type: &str,
        artifacts: Vec<Artifact>,
    ) -> Self {
        let content_hash = compute_hash(&artifacts);
        Self {
            evidence_id: format!("ev-{}", Uuid::new_v4()),
            session_id: session_id.to_string(),
            operation_id: operation_id.to_string(),
            operation_type: operation_type.to_string(),
            atomic_operation: true,
            aggregated: false,
            artifacts,
            content_hash,
            raw_log_refs: Vec::new(),
            task_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn with_raw_log(mut self, reference: impl Into<String>) -> Self {
        self.raw_log_refs.push(reference.into());
        self
    }

    pub fn recompute_hash(&self) -> String {
        compute_hash(&self.artifacts)
    }

    pub fn hash_matches(&self) -> bool {
        self.recompute_hash() == self.content_hash
    }
}

/// SHA-256 over every artifact's path and content, in order.
pub fn compute_hash(artifacts: &[Artifact]) -> String {
    let mut hasher = Sha256::new();
    for artifact in artifacts {
        hasher.update(artifact.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(artifact.content.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of raw bytes as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
