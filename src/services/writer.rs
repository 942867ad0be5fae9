//! Retrying location writer
//!
//! Inserts one location, retrying transient store failures with exponential
//! backoff until the elapsed budget runs out. Constraint violations mean the
//! row already exists and end the loop immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::db::{LocationStore, StoreError};
use crate::types::{LocationId, NewLocation};

/// How the writer reacts to a store error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Equivalent row already stored
    Skip,
    Retry,
    /// Retrying cannot help in this process
    Fatal,
}

pub fn classify(err: &StoreError) -> FailureClass {
    match err {
        StoreError::Constraint { .. } => FailureClass::Skip,
        StoreError::Closed => FailureClass::Fatal,
        StoreError::Timeout(_) | StoreError::Unavailable(_) | StoreError::Unexpected(_) => {
            FailureClass::Retry
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 1.5,
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_backoff)
    }
}

/// Told before every backoff sleep, e.g. to extend a delivery's ack deadline
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn before_retry(&self, attempt: u32);
}

#[derive(Debug)]
pub enum WriteOutcome {
    Inserted(LocationId),
    Duplicate,
    Failed { attempts: u32, error: StoreError },
}

pub struct LocationWriter {
    store: Arc<dyn LocationStore>,
    policy: RetryPolicy,
}

impl LocationWriter {
    pub fn new(store: Arc<dyn LocationStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn write(&self, location: &NewLocation, observer: &dyn RetryObserver) -> WriteOutcome {
        let started = Instant::now();
        let mut backoff = self.policy.initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt_started = Instant::now();

            let result = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.store.insert_location(location),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(self.policy.attempt_timeout)),
            };

            debug!(
                "Insert attempt {} for {}/{} took {:?}",
                attempts,
                location.identity.user,
                location.identity.device,
                attempt_started.elapsed()
            );

            let err = match result {
                Ok(id) => return WriteOutcome::Inserted(id),
                Err(err) => err,
            };

            match classify(&err) {
                FailureClass::Skip => {
                    warn!(
                        "Location {}/{} at {} already stored: {}",
                        location.identity.user,
                        location.identity.device,
                        location.device_timestamp,
                        err
                    );
                    return WriteOutcome::Duplicate;
                }
                FailureClass::Fatal => {
                    error!("Giving up on location insert after {} attempts: {}", attempts, err);
                    return WriteOutcome::Failed { attempts, error: err };
                }
                FailureClass::Retry => {}
            }

            let elapsed = started.elapsed();
            if elapsed + backoff > self.policy.max_elapsed {
                error!(
                    "Location insert for {}/{} failed after {} attempts in {:?}: {}",
                    location.identity.user, location.identity.device, attempts, elapsed, err
                );
                return WriteOutcome::Failed { attempts, error: err };
            }

            warn!(
                "Location insert attempt {} failed, retrying in {:?}: {}",
                attempts, backoff, err
            );
            observer.before_retry(attempts).await;
            tokio::time::sleep(backoff).await;
            backoff = self.policy.next_backoff(backoff);
        }
    }
}
