//! Connection retry with exponential backoff
//!
//! Only handshake failures start a fresh session. A session that connected
//! and then failed (provider error, disconnect, timeout) is never replayed,
//! since part of the text may already have been spoken.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::player::{PlaybackEvent, SessionOutcome, SpeakRequest, StreamingAudioPlayer};
use super::SpeechError;

/// Maximum attempts, including the first
const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_delay: RETRY_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry `n` (1-based): `base * 2^n`
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Speak, starting a fresh session whenever the connection could not be
/// established, up to `policy.max_attempts` sessions in total
///
/// Cancelling during a backoff sleep ends with `SessionOutcome::Cancelled`.
pub async fn speak_with_retry(
    player: &StreamingAudioPlayer,
    request: &SpeakRequest,
    policy: &RetryPolicy,
    events: &mpsc::UnboundedSender<PlaybackEvent>,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SpeechError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match player.speak(request, events, cancel).await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                log::warn!(
                    "Connection attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt,
                    max_attempts,
                    e,
                    delay
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::info!("Retry cancelled during backoff");
                        return Ok(SessionOutcome::Cancelled);
                    }
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    log::error!("Giving up after {} connection attempts", attempt);
                }
                return Err(e);
            }
            Ok(outcome) => {
                if attempt > 1 {
                    log::info!("Connected on attempt {}", attempt);
                }
                return Ok(outcome);
            }
        }
    }
}
