//! Review loop: judges delivered artifacts against criteria Q1 to Q6.
//!
//! - [`criteria`]: the six independent checks and the [`Candidate`] they read
//! - [`judgment`]: verdicts, modification instructions and the bounded
//!   per-task iteration counter
//!
//! ## Example
//!
//! ```
//! use phasegate::review::{Candidate, ReviewLoop, Verdict};
//!
//! let mut review = ReviewLoop::new(3);
//! let candidate = Candidate::new()
//!     .with_file("src/lib.rs", "pub fn one() -> u32 { 1 }\n")
//!     .require("src/lib.rs")
//!     .with_evidence("ev-1");
//!
//! let judgment = review.judge("task-1", &candidate);
//! assert_eq!(judgment.verdict, Verdict::Pass);
//! ```

pub mod criteria;
pub mod judgment;

pub use criteria::{Candidate, CriterionId, CriterionResult, evaluate_all};
pub use judgment::{Judgment, ReviewLoop, Verdict, is_transient_failure, modification_instruction};
