//! Retry utilities with exponential backoff and jitter.
//!
//! A general-purpose, cancellable retry loop for async operations that may
//! fail transiently. The status persistence helper and the operator's
//! pre-start hook polling are both built on it.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let result = retry_with_backoff(
//!     &ctx,
//!     &RetryConfig::with_max_attempts(5),
//!     "fetch_secret",
//!     || async { client.get("ns", "my-secret").await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::context::ReconcileContext;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Fixed delay between a bounded number of attempts, no jitter
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Why a retry loop gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed; holds the last error and the attempt count
    Exhausted {
        /// Error returned by the final attempt
        last: E,
        /// Number of attempts made
        attempts: u32,
    },
    /// The context was cancelled while waiting between attempts
    Cancelled {
        /// Error of the attempt before cancellation
        last: E,
        /// Number of attempts made
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// The last error seen
    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }

    /// Number of attempts made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, until `max_attempts` is reached (if non-zero), or
/// until `ctx` is cancelled while waiting for the next attempt.
///
/// # Arguments
/// * `ctx` - Cancellation for the waits between attempts
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E>(
    ctx: &ReconcileContext,
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        // Check if we've exhausted retries
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(RetryError::Exhausted {
                last: e,
                attempts: attempt,
            });
        }

        let wait = if config.jitter {
            // 0.5x to 1.5x of the delay
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter)
        } else {
            delay
        };

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = wait.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = ctx.cancelled() => {
                return Err(RetryError::Cancelled {
                    last: e,
                    attempts: attempt,
                });
            }
        }

        // Exponential backoff, capped at max_delay
        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
