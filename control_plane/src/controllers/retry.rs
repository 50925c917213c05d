use dashmap::DashMap;
use kube::runtime::controller::Action;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_RETRIES: u32 = 10;
const BASE_DELAY_SECS: u64 = 5;
const MAX_DELAY_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// API failures and conflicts that may resolve on their own.
    Transient,
    /// Invalid declarations that only a change of the object can fix.
    Permanent,
}

/// Failed reconciliation attempts per object key, reset on success.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: DashMap<String, u32>,
}

impl RetryTracker {
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.entry(key.to_string()).or_insert(0);
        *attempts += 1;
        *attempts
    }

    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.attempts.get(key).map_or(0, |attempts| *attempts)
    }
}

/// Exponential backoff from five seconds up to an hour for transient errors.
/// Beyond the retry limit transient errors keep retrying hourly. Permanent
/// errors wait for the object to change.
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient if attempt >= MAX_RETRIES => {
            warn!(
                attempt,
                max_retries = MAX_RETRIES,
                "Max retries exceeded, retrying at the maximum delay"
            );
            Action::requeue(Duration::from_secs(MAX_DELAY_SECS))
        }
        ErrorKind::Transient => {
            let delay_secs = BASE_DELAY_SECS
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
                .min(MAX_DELAY_SECS);
            debug!(attempt, delay_secs, "Scheduling retry");
            Action::requeue(Duration::from_secs(delay_secs))
        }
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for change");
            Action::await_change()
        }
    }
}
