use super::item::{EvidenceItem, sha256_hex};
use super::store::EvidenceStore;
use crate::errors::{CoreError, CoreResult, ErrorKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One line of the sealed index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub evidence_id: String,
    pub operation_id: String,
    pub operation_type: String,
    pub recorded_at: DateTime<Utc>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceIndex {
    pub session_id: String,
    pub finalized_at: DateTime<Utc>,
    pub entries: Vec<IndexEntry>,
}

/// Human-oriented summary written next to the index at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSummary {
    pub session_id: String,
    pub finalized_at: DateTime<Utc>,
    pub item_count: usize,
    pub operation_types: BTreeMap<String, usize>,
    pub index_hash: String,
    pub registered_operations: usize,
    pub operations_missing_evidence: Vec<String>,
    pub integrity_failures: usize,
}

/// A hash mismatch the ledger detected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub session_id: String,
    /// `None` when the index itself failed verification.
    pub evidence_id: Option<String>,
    pub expected: String,
    pub actual: String,
    pub detected_at: DateTime<Utc>,
}

/// Completeness view: registered operations against recorded evidence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceInventory {
    pub registered: Vec<String>,
    pub covered: Vec<String>,
    /// Registered operations with no evidence.
    pub missing: Vec<String>,
    /// Operations with evidence that were never registered.
    pub unregistered: Vec<String>,
}

impl EvidenceInventory {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Result of a successful integrity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub session_id: String,
    pub index_hash: String,
    pub items_verified: usize,
}

#[derive(Debug, Default)]
struct LedgerSession {
    evidence_ids: BTreeSet<String>,
    operations: BTreeSet<String>,
    finalized: bool,
}

/// Durable, hash-verified record of what each operation produced.
pub struct EvidenceLedger {
    store: Arc<dyn EvidenceStore>,
    sessions: BTreeMap<String, LedgerSession>,
    integrity_failures: Vec<IntegrityFailure>,
}

impl EvidenceLedger {
    pub fn new(store: Arc<dyn EvidenceStore>) -> Self {
        Self {
            store,
            sessions: BTreeMap::new(),
            integrity_failures: Vec::new(),
        }
    }

    /// Create the session's evidence area, picking up items already on disk.
    pub fn initialize_session(&mut self, session_id: &str) -> CoreResult<()> {
        self.store.init_session(session_id)?;
        let existing = self.store.list_items(session_id)?;
        let finalized = self.store.read_seal(session_id)?.is_some();
        let entry = self.sessions.entry(session_id.to_string()).or_default();
        entry
            .evidence_ids
            .extend(existing.into_iter().map(|i| i.evidence_id));
        entry.finalized |= finalized;
        debug!(
            session = session_id,
            items = entry.evidence_ids.len(),
            finalized = entry.finalized,
            "evidence session initialized"
        );
        Ok(())
    }

    fn session(&self, session_id: &str) -> CoreResult<&LedgerSession> {
        self.sessions.get(session_id).ok_or_else(|| not_initialized(session_id))
    }

    fn session_mut(&mut self, session_id: &str) -> CoreResult<&mut LedgerSession> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| not_initialized(session_id))
    }

    pub fn is_finalized(&self, session_id: &str) -> bool {
        self.sessions.get(session_id).is_some_and(|s| s.finalized)
    }

    pub fn integrity_failures(&self) -> &[IntegrityFailure] {
        &self.integrity_failures
    }

    fn record_failure(&mut self, failure: IntegrityFailure) {
        error!(
            session = %failure.session_id,
            evidence = ?failure.evidence_id,
            expected = %failure.expected,
            actual = %failure.actual,
            "evidence integrity violation"
        );
        self.integrity_failures.push(failure);
    }

    /// Accept one atomic evidence item.
    ///
    /// Aggregated items are refused before anything else is looked at.
    pub fn record_evidence(&mut self, item: EvidenceItem) -> CoreResult<String> {
        if item.aggregated {
            return Err(CoreError::new(
                ErrorKind::AggregatedEvidence,
                "aggregated evidence is not accepted; record one item per operation",
            )
            .with_detail("evidence_id", &item.evidence_id)
            .with_detail("operation_id", &item.operation_id)
            .with_detail("session_id", &item.session_id));
        }
        if !item.atomic_operation {
            return Err(CoreError::new(
                ErrorKind::NonAtomicEvidence,
                "evidence must come from a single atomic operation",
            )
            .with_detail("evidence_id", &item.evidence_id)
            .with_detail("operation_id", &item.operation_id)
            .with_detail("session_id", &item.session_id));
        }

        let session = self.session(&item.session_id)?;
        if session.finalized {
            return Err(CoreError::new(
                ErrorKind::EvidenceSessionFinalized,
                format!("evidence for session {} is already sealed", item.session_id),
            )
            .with_detail("session_id", &item.session_id)
            .with_detail("evidence_id", &item.evidence_id));
        }
        if session.evidence_ids.contains(&item.evidence_id) {
            return Err(CoreError::new(
                ErrorKind::DuplicateEvidence,
                format!("evidence {} already recorded", item.evidence_id),
            )
            .with_detail("evidence_id", &item.evidence_id)
            .with_detail("session_id", &item.session_id));
        }

        let actual = item.recompute_hash();
        if actual != item.content_hash {
            let err = CoreError::new(
                ErrorKind::IntegrityViolation,
                format!("content hash mismatch for evidence {}", item.evidence_id),
            )
            .with_detail("evidence_id", &item.evidence_id)
            .with_detail("expected", &item.content_hash)
            .with_detail("actual", &actual);
            self.record_failure(IntegrityFailure {
                session_id: item.session_id.clone(),
                evidence_id: Some(item.evidence_id.clone()),
                expected: item.content_hash.clone(),
                actual,
                detected_at: Utc::now(),
            });
            return Err(err);
        }

        self.store.put_item(&item)?;
        let id = item.evidence_id.clone();
        self.session_mut(&item.session_id)?
            .evidence_ids
            .insert(id.clone());
        info!(
            session = %item.session_id,
            evidence = %id,
            operation = %item.operation_id,
            "evidence recorded"
        );
        Ok(id)
    }

    /// Recompute a stored item's hash and compare it to the recorded one.
    pub fn verify_evidence(&mut self, session_id: &str, evidence_id: &str) -> CoreResult<()> {
        let item = self.store.get_item(session_id, evidence_id)?.ok_or_else(|| {
            CoreError::new(
                ErrorKind::EvidenceNotFound,
                format!("evidence {} not found", evidence_id),
            )
            .with_detail("session_id", session_id)
            .with_detail("evidence_id", evidence_id)
        })?;
        let actual = item.recompute_hash();
        if actual != item.content_hash {
            self.record_failure(IntegrityFailure {
                session_id: session_id.to_string(),
                evidence_id: Some(evidence_id.to_string()),
                expected: item.content_hash.clone(),
                actual: actual.clone(),
                detected_at: Utc::now(),
            });
            return Err(CoreError::new(
                ErrorKind::IntegrityViolation,
                format!("evidence {} does not match its recorded hash", evidence_id),
            )
            .with_detail("session_id", session_id)
            .with_detail("evidence_id", evidence_id)
            .with_detail("expected", &item.content_hash)
            .with_detail("actual", actual));
        }
        Ok(())
    }

    pub fn item(&self, session_id: &str, evidence_id: &str) -> CoreResult<Option<EvidenceItem>> {
        self.store.get_item(session_id, evidence_id)
    }

    pub fn items(&self, session_id: &str) -> CoreResult<Vec<EvidenceItem>> {
        self.store.list_items(session_id)
    }

    /// Register an operation that is expected to produce evidence.
    pub fn register_operation(&mut self, session_id: &str, operation_id: &str) -> CoreResult<()> {
        self.session_mut(session_id)?
            .operations
            .insert(operation_id.to_string());
        Ok(())
    }

    /// Store a raw execution log for later reference from an evidence item.
    pub fn record_raw_log(&self, session_id: &str, name: &str, content: &str) -> CoreResult<String> {
        self.session(session_id)?;
        self.store.put_raw_log(session_id, name, content)
    }

    /// Cross-reference registered operations against recorded evidence.
    pub fn get_evidence_inventory(&self, session_id: &str) -> CoreResult<EvidenceInventory> {
        let session = self.session(session_id)?;
        let covered: BTreeSet<String> = self
            .store
            .list_items(session_id)?
            .into_iter()
            .map(|i| i.operation_id)
            .collect();
        Ok(EvidenceInventory {
            registered: session.operations.iter().cloned().collect(),
            missing: session.operations.difference(&covered).cloned().collect(),
            unregistered: covered.difference(&session.operations).cloned().collect(),
            covered: covered.into_iter().collect(),
        })
    }

    /// Build the ordered index, seal it with its own hash and write the summary.
    pub fn finalize_session(&mut self, session_id: &str) -> CoreResult<EvidenceSummary> {
        if self.session(session_id)?.finalized {
            return Err(CoreError::new(
                ErrorKind::EvidenceSessionFinalized,
                format!("evidence for session {} is already sealed", session_id),
            )
            .with_detail("session_id", session_id));
        }

        let items = self.store.list_items(session_id)?;
        let finalized_at = Utc::now();
        let index = EvidenceIndex {
            session_id: session_id.to_string(),
            finalized_at,
            entries: items
                .iter()
                .map(|i| IndexEntry {
                    evidence_id: i.evidence_id.clone(),
                    operation_id: i.operation_id.clone(),
                    operation_type: i.operation_type.clone(),
                    recorded_at: i.recorded_at,
                    content_hash: i.content_hash.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| CoreError::serialization("Failed to serialize evidence index", e))?;
        let seal = sha256_hex(&bytes);
        self.store.write_index(session_id, &bytes, &seal)?;

        let inventory = self.get_evidence_inventory(session_id)?;
        let mut operation_types = BTreeMap::new();
        for item in &items {
            *operation_types
                .entry(item.operation_type.clone())
                .or_insert(0) += 1;
        }
        let summary = EvidenceSummary {
            session_id: session_id.to_string(),
            finalized_at,
            item_count: items.len(),
            operation_types,
            index_hash: seal,
            registered_operations: inventory.registered.len(),
            operations_missing_evidence: inventory.missing,
            integrity_failures: self
                .integrity_failures
                .iter()
                .filter(|f| f.session_id == session_id)
                .count(),
        };
        self.store.write_summary(&summary)?;
        self.session_mut(session_id)?.finalized = true;
        info!(session = session_id, items = items.len(), hash = %summary.index_hash, "evidence sealed");
        Ok(summary)
    }

    /// Check the sealed index against its seal, then every indexed item
    /// against the hash the index recorded for it.
    pub fn verify_session_integrity(&mut self, session_id: &str) -> CoreResult<IntegrityReport> {
        let (Some(bytes), Some(seal)) = (
            self.store.read_index(session_id)?,
            self.store.read_seal(session_id)?,
        ) else {
            return Err(CoreError::new(
                ErrorKind::EvidenceNotFound,
                format!("no sealed evidence index for session {}", session_id),
            )
            .with_detail("session_id", session_id));
        };

        let actual = sha256_hex(&bytes);
        if actual != seal {
            self.record_failure(IntegrityFailure {
                session_id: session_id.to_string(),
                evidence_id: None,
                expected: seal.clone(),
                actual: actual.clone(),
                detected_at: Utc::now(),
            });
            return Err(CoreError::new(
                ErrorKind::IntegrityViolation,
                format!("evidence index for session {} was modified after sealing", session_id),
            )
            .with_detail("session_id", session_id)
            .with_detail("expected", seal)
            .with_detail("actual", actual));
        }

        let index: EvidenceIndex = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::serialization("Failed to parse evidence index", e))?;
        for entry in &index.entries {
            self.verify_evidence(session_id, &entry.evidence_id)?;
            let stored = self.store.get_item(session_id, &entry.evidence_id)?;
            if let Some(item) = stored
                && item.content_hash != entry.content_hash
            {
                self.record_failure(IntegrityFailure {
                    session_id: session_id.to_string(),
                    evidence_id: Some(entry.evidence_id.clone()),
                    expected: entry.content_hash.clone(),
                    actual: item.content_hash.clone(),
                    detected_at: Utc::now(),
                });
                return Err(CoreError::new(
                    ErrorKind::IntegrityViolation,
                    format!("evidence {} differs from the sealed index", entry.evidence_id),
                )
                .with_detail("session_id", session_id)
                .with_detail("evidence_id", &entry.evidence_id));
            }
        }

        if index.entries.is_empty() {
            warn!(session = session_id, "sealed index contains no evidence");
        }
        Ok(IntegrityReport {
            session_id: session_id.to_string(),
            index_hash: actual,
            items_verified: index.entries.len(),
        })
    }
}

fn not_initialized(session_id: &str) -> CoreError {
    CoreError::new(
        ErrorKind::EvidenceSessionNotInitialized,
        format!("evidence session {} is not initialized", session_id),
    )
    .with_detail("session_id", session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::item::Artifact;
    use crate::evidence::store::{FileEvidenceStore, MemoryEvidenceStore, INDEX_FILE};
    use tempfile::tempdir;

    fn ledger() -> (EvidenceLedger, Arc<MemoryEvidenceStore>) {
        let store = Arc::new(MemoryEvidenceStore::new());
        let mut ledger = EvidenceLedger::new(store.clone());
        ledger.initialize_session("s1").unwrap();
        (ledger, store)
    }

    fn item(op: &str) -> EvidenceItem {
        EvidenceItem::new("s1", op, "file_write", vec![Artifact::new("src/a.rs", op)])
    }

    #[test]
    fn test_aggregated_rejected_regardless_of_other_fields() {
        let (mut ledger, _) = ledger();
        let mut bad = item("op-1");
        bad.aggregated = true;
        let err = ledger.record_evidence(bad.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AggregatedEvidence);

        bad.atomic_operation = false;
        bad.session_id = "never-initialized".to_string();
        let err = ledger.record_evidence(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AggregatedEvidence);
    }

    #[test]
    fn test_non_atomic_rejected_before_storage() {
        let (mut ledger, store) = ledger();
        let mut bad = item("op-1");
        bad.atomic_operation = false;
        let err = ledger.record_evidence(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonAtomicEvidence);
        assert!(store.list_items("s1").unwrap().is_empty());
    }

    #[test]
    fn test_uninitialized_session_rejected() {
        let store = Arc::new(MemoryEvidenceStore::new());
        let mut ledger = EvidenceLedger::new(store);
        let err = ledger.record_evidence(item("op")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceSessionNotInitialized);
    }

    #[test]
    fn test_hash_mismatch_rejected_and_recorded() {
        let (mut ledger, _) = ledger();
        let mut bad = item("op-1");
        bad.content_hash = "0".repeat(64);
        let err = ledger.record_evidence(bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
        assert_eq!(ledger.integrity_failures().len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (mut ledger, _) = ledger();
        let good = item("op-1");
        ledger.record_evidence(good.clone()).unwrap();
        let err = ledger.record_evidence(good).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateEvidence);
    }

    #[test]
    fn test_verify_detects_tampered_item() {
        let (mut ledger, store) = ledger();
        let good = item("op-1");
        let id = ledger.record_evidence(good.clone()).unwrap();
        ledger.verify_evidence("s1", &id).unwrap();

        let mut tampered = good;
        tampered.artifacts[0].content = "changed".to_string();
        store.tamper_item(&tampered).unwrap();
        let err = ledger.verify_evidence("s1", &id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
        assert_eq!(ledger.integrity_failures().len(), 1);

        let err = ledger.verify_evidence("s1", "ev-missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceNotFound);
    }

    #[test]
    fn test_finalize_seals_and_blocks_further_records() {
        let (mut ledger, store) = ledger();
        ledger.record_evidence(item("op-1")).unwrap();
        ledger.record_evidence(item("op-2")).unwrap();
        let summary = ledger.finalize_session("s1").unwrap();
        assert_eq!(summary.item_count, 2);
        assert_eq!(summary.operation_types.get("file_write"), Some(&2));
        assert!(store.summary("s1").is_some());

        let report = ledger.verify_session_integrity("s1").unwrap();
        assert_eq!(report.items_verified, 2);
        assert_eq!(report.index_hash, summary.index_hash);

        let err = ledger.record_evidence(item("op-3")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceSessionFinalized);
        let err = ledger.finalize_session("s1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceSessionFinalized);
    }

    #[test]
    fn test_tampered_index_detected_in_memory() {
        let (mut ledger, store) = ledger();
        ledger.record_evidence(item("op-1")).unwrap();
        ledger.finalize_session("s1").unwrap();
        store.tamper_index("s1", b"{\"entries\": []}").unwrap();
        let err = ledger.verify_session_integrity("s1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    }

    #[test]
    fn test_tampered_index_file_detected_after_restart() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = EvidenceLedger::new(Arc::new(FileEvidenceStore::new(dir.path())));
            ledger.initialize_session("s1").unwrap();
            ledger.record_evidence(item("op-1")).unwrap();
            ledger.finalize_session("s1").unwrap();
        }

        let index_path = dir.path().join("s1").join(INDEX_FILE);
        let original = std::fs::read_to_string(&index_path).unwrap();
        std::fs::write(&index_path, original.replace("file_write", "file_delete")).unwrap();

        let mut ledger = EvidenceLedger::new(Arc::new(FileEvidenceStore::new(dir.path())));
        ledger.initialize_session("s1").unwrap();
        assert!(ledger.is_finalized("s1"));
        let err = ledger.verify_session_integrity("s1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
        assert!(ledger.integrity_failures()[0].evidence_id.is_none());
    }

    #[test]
    fn test_verify_before_finalize_fails() {
        let (mut ledger, _) = ledger();
        let err = ledger.verify_session_integrity("s1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EvidenceNotFound);
    }

    #[test]
    fn test_inventory_reports_missing_operations() {
        let (mut ledger, _) = ledger();
        for op in ["op-1", "op-2", "op-3"] {
            ledger.register_operation("s1", op).unwrap();
        }
        ledger.record_evidence(item("op-1")).unwrap();
        ledger.record_evidence(item("op-extra")).unwrap();

        let inventory = ledger.get_evidence_inventory("s1").unwrap();
        assert_eq!(inventory.missing, vec!["op-2".to_string(), "op-3".to_string()]);
        assert_eq!(inventory.unregistered, vec!["op-extra".to_string()]);
        assert!(!inventory.is_complete());
    }

    #[test]
    fn test_raw_log_reference() {
        let (ledger, store) = ledger();
        let reference = ledger.record_raw_log("s1", "task-1", "output").unwrap();
        assert_eq!(
            store.read_raw_log("s1", &reference).unwrap().as_deref(),
            Some("output")
        );
        assert!(ledger.record_raw_log("other", "x", "y").is_err());
    }
}
