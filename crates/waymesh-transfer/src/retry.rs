//! Bounded exponential backoff for transient send failures.

use std::time::Duration;

use tracing::trace;

use crate::error::Result;
use crate::overlay::Overlay;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(150),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * (1u32 << retry.min(16))
    }
}

/// Send a datagram, retrying only transient failures.
pub async fn send_with_retry(
    overlay: &dyn Overlay,
    to: &str,
    payload: &[u8],
    policy: &RetryPolicy,
) -> Result<()> {
    let mut retry = 0;
    loop {
        match overlay.send(to, payload).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && retry < policy.max_retries => {
                let delay = policy.delay_for(retry);
                trace!(%to, retry, ?delay, error = %e, "transient send failure");
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
