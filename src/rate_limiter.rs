//! Per-channel rate governor.
//!
//! Each outbound channel owns one [`RateGovernor`]. It combines a local rate
//! model (token bucket or sliding window) with a cooldown state that is
//! entered when the provider reports throttling. All state lives behind one
//! mutex which is never held across a sleep.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local accounting model of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateModel {
    /// One token every `interval`, holding at most `burst` tokens.
    TokenBucket { interval: Duration, burst: u32 },
    /// At most `limit` grants in any rolling `window`.
    SlidingWindow { limit: u32, window: Duration },
}

/// Answer of [`RateGovernor::try_acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Local accounting is exhausted; a slot is expected after the hint.
    Wait(Duration),
    /// The channel is cooling down for the remaining duration.
    Cooldown(Duration),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("cancelled while waiting for a delivery slot")]
    Cancelled,
}

#[derive(Debug)]
struct RateState {
    tokens: f64,
    last_refill: Instant,
    granted_at: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

#[derive(Debug)]
pub struct RateGovernor {
    channel: String,
    model: RateModel,
    state: Mutex<RateState>,
}

// Lower bound on wait hints so callers never spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

impl RateGovernor {
    pub fn new(channel: impl Into<String>, model: RateModel) -> Self {
        let tokens = match &model {
            RateModel::TokenBucket { burst, .. } => f64::from((*burst).max(1)),
            RateModel::SlidingWindow { .. } => 0.0,
        };
        Self {
            channel: channel.into(),
            model,
            state: Mutex::new(RateState {
                tokens,
                last_refill: Instant::now(),
                granted_at: VecDeque::new(),
                cooldown_until: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking admission check. Consumes a slot when granted.
    pub fn try_acquire(&self) -> Admission {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Admission::Cooldown(until - now);
            }
            state.cooldown_until = None;
            info!(channel = %self.channel, "Cooldown expired, resuming normal accounting");
        }

        match &self.model {
            RateModel::TokenBucket { interval, burst } => {
                if interval.is_zero() {
                    return Admission::Granted;
                }
                let capacity = f64::from((*burst).max(1));
                let refill_per_sec = 1.0 / interval.as_secs_f64();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    Admission::Granted
                } else {
                    let secs = (1.0 - state.tokens) / refill_per_sec;
                    Admission::Wait(Duration::from_secs_f64(secs).max(MIN_WAIT))
                }
            }
            RateModel::SlidingWindow { limit, window } => {
                while let Some(oldest) = state.granted_at.front() {
                    if now.duration_since(*oldest) >= *window {
                        state.granted_at.pop_front();
                    } else {
                        break;
                    }
                }
                if state.granted_at.len() < (*limit).max(1) as usize {
                    state.granted_at.push_back(now);
                    Admission::Granted
                } else {
                    let oldest = state.granted_at.front().copied().unwrap_or(now);
                    let wait = window.saturating_sub(now.duration_since(oldest));
                    Admission::Wait(wait.max(MIN_WAIT))
                }
            }
        }
    }

    /// Waits until a slot is granted or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), GovernorError> {
        loop {
            if cancel.is_cancelled() {
                return Err(GovernorError::Cancelled);
            }
            let wait = match self.try_acquire() {
                Admission::Granted => return Ok(()),
                Admission::Wait(d) => d,
                Admission::Cooldown(d) => {
                    debug!(channel = %self.channel, remaining_secs = d.as_secs(), "Channel cooling down");
                    d
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GovernorError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// The provider rejected a call for throttling. Refuses everything for
    /// `cooldown` and forgets the sliding-window history. An already running
    /// cooldown is never shortened.
    pub fn report_throttled(&self, cooldown: Duration) {
        let until = Instant::now() + cooldown;
        let mut state = self.lock();
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |current| current.max(until)));
        state.granted_at.clear();
        warn!(
            channel = %self.channel,
            cooldown_secs = cooldown.as_secs(),
            "Provider throttled channel, entering cooldown"
        );
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .cooldown_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    pub fn in_cooldown(&self) -> bool {
        self.cooldown_remaining().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn bucket(interval_secs: u64, burst: u32) -> RateGovernor {
        RateGovernor::new(
            "test",
            RateModel::TokenBucket {
                interval: Duration::from_secs(interval_secs),
                burst,
            },
        )
    }

    fn window(limit: u32, window_secs: u64) -> RateGovernor {
        RateGovernor::new(
            "test",
            RateModel::SlidingWindow {
                limit,
                window: Duration::from_secs(window_secs),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_wait() {
        let gov = bucket(1, 3);
        for _ in 0..3 {
            assert!(gov.try_acquire().is_granted());
        }
        match gov.try_acquire() {
            Admission::Wait(d) => assert!(d <= Duration::from_secs(1) && d > Duration::ZERO),
            other => panic!("expected wait, got {:?}", other),
        }
        advance(Duration::from_secs(1)).await;
        assert!(gov.try_acquire().is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_limit() {
        let gov = window(2, 60);
        assert!(gov.try_acquire().is_granted());
        advance(Duration::from_secs(10)).await;
        assert!(gov.try_acquire().is_granted());
        assert_eq!(gov.try_acquire(), Admission::Wait(Duration::from_secs(50)));

        advance(Duration::from_secs(50)).await;
        assert!(gov.try_acquire().is_granted());
        assert!(!gov.try_acquire().is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_until_expiry() {
        let gov = bucket(1, 3);
        gov.report_throttled(Duration::from_secs(600));

        for _ in 0..5 {
            assert!(matches!(gov.try_acquire(), Admission::Cooldown(_)));
            advance(Duration::from_secs(119)).await;
        }
        // 595s elapsed
        assert_eq!(gov.try_acquire(), Admission::Cooldown(Duration::from_secs(5)));
        advance(Duration::from_secs(4)).await;
        assert!(gov.in_cooldown());
        advance(Duration::from_secs(1)).await;

        assert!(!gov.in_cooldown());
        for _ in 0..3 {
            assert!(gov.try_acquire().is_granted());
        }
        assert!(matches!(gov.try_acquire(), Admission::Wait(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_resets_window() {
        let gov = window(2, 600);
        assert!(gov.try_acquire().is_granted());
        assert!(gov.try_acquire().is_granted());

        gov.report_throttled(Duration::from_secs(60));
        advance(Duration::from_secs(60)).await;

        assert!(gov.try_acquire().is_granted());
        assert!(gov.try_acquire().is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_not_shortened() {
        let gov = bucket(1, 1);
        gov.report_throttled(Duration::from_secs(600));
        gov.report_throttled(Duration::from_secs(60));
        assert_eq!(gov.cooldown_remaining(), Some(Duration::from_secs(600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let gov = bucket(2, 1);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        gov.acquire(&cancel).await.unwrap();
        gov.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_respects_cancellation() {
        let gov = bucket(1, 1);
        gov.report_throttled(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(gov.acquire(&cancel).await, Err(GovernorError::Cancelled));
    }
}
