// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! The retry policy shared by the publisher and the consumer runtime. Transient
//! failures (broker unreachable, connection dropped) are retried after a delay
//! until the policy's attempt budget runs out; fatal failures are returned on
//! the first occurrence.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How the delay grows between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always wait `retry_delay`.
    #[default]
    Fixed,
    /// Double the delay after every failed attempt, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Retry parameters for establishing a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::unbounded(DEFAULT_RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Retries transient failures forever, waiting `retry_delay` in between.
    pub fn unbounded(retry_delay: Duration) -> Self {
        RetryPolicy {
            retry_delay,
            max_attempts: None,
            backoff: Backoff::Fixed,
        }
    }

    /// One attempt, no retry.
    pub fn single_shot() -> Self {
        RetryPolicy {
            retry_delay: Duration::ZERO,
            max_attempts: Some(1),
            backoff: Backoff::Fixed,
        }
    }

    /// Replaces the backoff strategy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Caps the number of attempts; values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.retry_delay.saturating_mul(factor).min(max_delay)
            }
        }
    }
}

/// Drives connection attempts according to a [`RetryPolicy`], aborting the
/// wait when its cancellation token fires.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    /// Creates a supervisor that gives up waiting when `shutdown` is cancelled.
    pub fn new(policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        ConnectionSupervisor { policy, shutdown }
    }

    /// A supervisor that never retries and cannot be cancelled.
    pub fn single_shot() -> Self {
        ConnectionSupervisor::new(RetryPolicy::single_shot(), CancellationToken::new())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt` until it succeeds, fails fatally, exhausts the policy, or
    /// the supervisor is cancelled (reported as [`AmqpError::Cancelled`]).
    ///
    /// `attempt` receives the 1-based attempt number.
    pub async fn establish<T, F, Fut>(&self, mut attempt: F) -> Result<T, AmqpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let mut number = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(AmqpError::Cancelled);
            }

            number = number.saturating_add(1);

            let err = match attempt(number).await {
                Ok(value) => {
                    if number > 1 {
                        info!(attempts = number, "broker connection re-established");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                error!(error = %err, attempt = number, "fatal broker error, not retrying");
                return Err(err);
            }

            if !self.policy.allows_retry_after(number) {
                warn!(error = %err, attempt = number, "broker unavailable, giving up");
                return Err(err);
            }

            let delay = self.policy.delay_after(number);
            warn!(
                error = %err,
                attempt = number,
                retry_in = ?delay,
                "broker unavailable, retrying"
            );

            if !self.pause(delay).await {
                return Err(AmqpError::Cancelled);
            }
        }
    }

    /// Sleeps for `delay`; returns `false` when cancelled first.
    pub async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
