//! phasegate: an evidence-gated lifecycle orchestrator for code-generation
//! executors.
//!
//! A session moves through seven phases. Work inside a phase runs in bounded
//! worker pools under file locks, every operation leaves hash-verified
//! evidence, and delivered artifacts pass a six-criterion review before they
//! count. Nothing advances on an incomplete or unproven checkpoint without an
//! explicit continuation approval.

pub mod config;
pub mod continuation;
pub mod errors;
pub mod evidence;
pub mod executor;
pub mod lifecycle;
pub mod locks;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod review;
pub mod session;
pub mod tracer;

pub use errors::{CoreError, CoreResult, ErrorKind};
pub use phase::Phase;
