//! Outbound HTTP with bounded retries.
//!
//! A call is retried when the transport fails or the upstream answers with a
//! 5xx status. Every other status is returned on the attempt that produced
//! it; the body is never inspected here.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::{BackoffKind, RetryConfig};
use crate::error::{GatewayError, Result};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Wait before retry number `retry` (1 for the first retry).
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, retry: u32) -> Duration;
}

impl<F> BackoffPolicy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, retry: u32) -> Duration {
        self(retry)
    }
}

/// `retry × unit`.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub unit: Duration,
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn delay(&self, retry: u32) -> Duration {
        self.unit.saturating_mul(retry)
    }
}

/// `base × 2^(retry-1)` capped at `max`, optionally with ±25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let delay = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter {
            return delay;
        }

        let scale = rand::thread_rng().gen_range(0.75..=1.25);
        delay.mul_f64(scale).min(self.max)
    }
}

/// Attempt bookkeeping for one `execute` call.
#[derive(Debug, Default)]
struct RetryOutcome {
    attempts: u32,
    last_error: String,
}

#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    backoff: Arc<dyn BackoffPolicy>,
    max_attempts: u32,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    /// Linear backoff, three attempts.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            backoff: Arc::new(LinearBackoff::default()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// The pooled client shared by every request of a gateway.
    pub fn build_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?)
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let base = Duration::from_millis(config.base_delay_ms);
        let forwarder = Self::new(Self::build_client()?).with_max_attempts(config.max_attempts);

        Ok(match config.backoff {
            BackoffKind::Linear => forwarder.with_backoff(LinearBackoff { unit: base }),
            BackoffKind::Exponential => forwarder.with_backoff(ExponentialBackoff {
                base,
                max: Duration::from_millis(config.max_delay_ms),
                jitter: true,
            }),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Send `request`, retrying transport failures and 5xx answers.
    ///
    /// Each attempt sends a fresh clone, so the request body must be
    /// buffered. Cancelling `cancel` during a backoff wait or an in-flight
    /// attempt returns [`GatewayError::Cancelled`] at once.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: reqwest::Request,
    ) -> Result<reqwest::Response> {
        let mut outcome = RetryOutcome::default();

        for retry in 0..self.max_attempts {
            if retry > 0 {
                let wait = self.backoff.delay(retry);
                tracing::debug!(
                    retry,
                    delay_ms = wait.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            let attempt = request
                .try_clone()
                .ok_or_else(|| GatewayError::internal("request body is not replayable"))?;
            outcome.attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                result = self.client.execute(attempt) => result,
            };

            match result {
                Ok(response) if response.status().as_u16() >= 500 => {
                    outcome.last_error = format!("upstream error: {}", response.status().as_u16());
                    tracing::warn!(
                        attempt = outcome.attempts,
                        status = response.status().as_u16(),
                        url = %request.url(),
                        "Upstream server error"
                    );
                }
                Ok(response) => {
                    tracing::debug!(
                        attempt = outcome.attempts,
                        status = response.status().as_u16(),
                        "Upstream responded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    outcome.last_error = e.to_string();
                    tracing::warn!(
                        attempt = outcome.attempts,
                        error = %e,
                        url = %request.url(),
                        "Upstream transport error"
                    );
                }
            }
        }

        tracing::warn!(
            attempts = outcome.attempts,
            last_error = %outcome.last_error,
            "Max retry attempts exceeded"
        );
        Err(GatewayError::RetriesExhausted {
            attempts: outcome.attempts,
            last_error: outcome.last_error,
        })
    }
}
