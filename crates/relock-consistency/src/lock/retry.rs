// Topology-safe retries for store transactions

use std::time::Duration;

use relock_common::{LockConfig, StoreError};
use tracing::{error, warn};

/// How often and how patiently a transaction is retried after the cluster
/// topology changed underneath it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for RetryPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            max_retries: config.tx_max_retries,
            delay: config.retry_delay(),
        }
    }
}

/// Run `op`, retrying it while it fails with a retryable error.
///
/// Non-retryable errors are returned as is. Once the retries are used up the
/// last error is wrapped in [`StoreError::RetriesExhausted`].
pub fn retry_topology_safe<T>(
    policy: &RetryPolicy,
    key: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op() {
            Err(e) if e.is_retryable() => {
                if attempts > policy.max_retries {
                    error!(key = %key, attempts, error = %e, "Transaction retries exhausted");
                    return Err(StoreError::RetriesExhausted {
                        key: key.to_string(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                warn!(key = %key, attempt = attempts, error = %e, "Retrying transaction after topology change");
                if !policy.delay.is_zero() {
                    std::thread::sleep(policy.delay);
                }
            }
            other => return other,
        }
    }
}
