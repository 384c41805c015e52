//! Controller implementations for watching and reconciling resources

pub mod lightspeed_controller;

use kube::Client;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::OperatorConfig;
use crate::reconcilers::Reconciler;
use crate::resolver::WatchTable;
use crate::store::KubeStore;

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delay before retry number `attempt` (starting at 1): 5s doubling up
/// to 5 minutes
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_MAX)
}

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub reconciler: Reconciler<KubeStore>,
    /// Cancelled when the operator shuts down
    pub shutdown: CancellationToken,
    failures: Mutex<BTreeMap<String, u32>>,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, operator: OperatorConfig, shutdown: CancellationToken) -> Arc<Self> {
        let reconciler = Reconciler::new(
            Arc::new(KubeStore::new(client.clone())),
            Arc::new(operator),
            WatchTable::new(),
        );
        Arc::new(Self {
            client,
            reconciler,
            shutdown,
            failures: Mutex::new(BTreeMap::new()),
        })
    }

    /// Record a failure for `name` and return how long to wait
    pub fn next_backoff(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let attempt = failures.entry(name.to_string()).or_insert(0);
        *attempt = attempt.saturating_add(1);
        backoff_delay(*attempt)
    }

    pub fn reset_backoff(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}
