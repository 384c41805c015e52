//! Reconciliation logic for LightspeedConfig resources

pub mod lightspeed;
pub mod status;

pub use lightspeed::{CycleReport, Reconciler, Step, StepResult};
