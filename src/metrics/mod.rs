//! Prometheus metrics for the Lightspeed Operator
//!
//! Reconcile counters, durations and per-object convergence outcomes,
//! served over HTTP alongside health and readiness probes.

pub mod prometheus;

pub use prometheus::*;
