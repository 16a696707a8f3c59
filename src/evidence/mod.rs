//! Evidence ledger: atomic, hash-verified proof of every operation.
//!
//! Items are written once. At finalization the session's items are listed in
//! an ordered index and the index file is sealed with its own SHA-256, so
//! tampering is detectable after the process exits.

pub mod item;
pub mod ledger;
pub mod store;

pub use item::{Artifact, EvidenceItem, compute_hash};
pub use ledger::{
    EvidenceIndex, EvidenceInventory, EvidenceLedger, EvidenceSummary, IndexEntry,
    IntegrityFailure, IntegrityReport,
};
pub use store::{EvidenceStore, FileEvidenceStore, MemoryEvidenceStore};
