use std::thread;
use std::time::Duration;

use super::error::ProviderError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 45;

#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    Pending,
    Ready(T),
    Failed(String),
}

/// Fixed-interval polling shared by every submit-then-poll provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_POLL_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    pub fn ceiling(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    /// Calls `check` until it reports a terminal status or attempts run out.
    /// Errors returned by `check` end the loop unchanged. Exhaustion is a
    /// transient timeout.
    pub fn poll_until<T, F>(&self, provider: &str, mut check: F) -> Result<T, ProviderError>
    where
        F: FnMut(u32) -> Result<PollStatus<T>, ProviderError>,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 1..=attempts {
            match check(attempt)? {
                PollStatus::Ready(value) => return Ok(value),
                PollStatus::Failed(reason) => return Err(ProviderError::reported(provider, reason)),
                PollStatus::Pending => {
                    if attempt < attempts && !self.interval.is_zero() {
                        thread::sleep(self.interval);
                    }
                }
            }
        }
        Err(ProviderError::transient(
            provider,
            format!(
                "{provider} generation timed out after {attempts} polls ({}s).",
                self.ceiling().as_secs()
            ),
        ))
    }
}
