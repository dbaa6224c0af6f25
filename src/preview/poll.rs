//! Bounded polling.
//!
//! Every wait in the controller (API health, pod health, certificate
//! readiness, load-balancer IP, namespace deletion) goes through
//! [`poll_until`]: a fixed interval, a fixed number of attempts, and a check
//! that either yields a value or reports what it saw. Running out of attempts
//! is a [`PreviewError::Timeout`] carrying the last observation.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, error};

use super::error::PreviewError;

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    Ready(T),
    /// Not there yet. The string is a diagnostic snapshot of what was observed.
    Pending(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollConfig {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping between attempts
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Poll interval and attempt count as they appear in settings files
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl PollSettings {
    pub const fn new(interval_secs: u64, max_attempts: u32) -> Self {
        Self {
            interval_secs,
            max_attempts,
        }
    }

    pub fn config(&self) -> PollConfig {
        PollConfig::new(Duration::from_secs(self.interval_secs), self.max_attempts)
    }
}

/// Run `check` until it returns [`Poll::Ready`] or `config.max_attempts` is used up.
///
/// An `Err` from `check` aborts the wait immediately. Checks that want to
/// tolerate a failing probe should map it to `Poll::Pending` themselves.
pub async fn poll_until<F, Fut, T>(config: &PollConfig, operation: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    debug!(
        operation = %operation,
        max_attempts = config.max_attempts,
        budget_secs = config.budget().as_secs(),
        "Waiting"
    );
    let mut last_observed = String::from("nothing observed");

    for attempt in 1..=config.max_attempts {
        match check().await? {
            Poll::Ready(value) => {
                debug!(operation = %operation, attempt, "Condition met");
                return Ok(value);
            }
            Poll::Pending(observed) => {
                debug!(
                    operation = %operation,
                    attempt,
                    max_attempts = config.max_attempts,
                    observed = %observed,
                    "Condition not met yet"
                );
                last_observed = observed;
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    error!(
        operation = %operation,
        attempts = config.max_attempts,
        last_observed = %last_observed,
        "Gave up waiting"
    );

    Err(PreviewError::Timeout {
        operation: operation.to_string(),
        attempts: config.max_attempts,
        last_observed,
    }
    .into())
}
