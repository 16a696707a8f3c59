//! The seven-phase lifecycle: controller, evidence gates and final report.

mod controller;
pub mod gate;
mod report;

pub use controller::LifecycleController;
pub use report::{FinalReport, PhaseTiming, TaskCounts};
