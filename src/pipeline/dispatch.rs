//! Fan-out of new releases to every enabled notification channel.
//!
//! Each channel is paced by its own [`RateGovernor`]. A channel that gets
//! throttled is put into cooldown and skipped for the rest of the run; the
//! other channels keep going.

use crate::app::ports::{DeliveryError, NotificationChannel};
use crate::rate_limiter::{GovernorError, RateGovernor};
use crate::template::Template;
use crate::types::ReleaseInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Releases sent per batch.
    pub batch_size: usize,
    pub batch_pause: Duration,
    /// Pause after every delivery attempt.
    pub delivery_pause: Duration,
    /// Longest wait for a governor slot before giving up on one delivery.
    pub acquire_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: crate::constants::DEFAULT_DISPATCH_BATCH_SIZE,
            batch_pause: crate::constants::DEFAULT_DISPATCH_BATCH_PAUSE,
            delivery_pause: crate::constants::DEFAULT_DELIVERY_PAUSE,
            acquire_timeout: crate::constants::DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("{channel} rate limited while sending {release}: {source}")]
    RateLimited {
        channel: String,
        release: String,
        source: DeliveryError,
    },

    #[error("{channel} is cooling down for another {}s, {release} not sent", .remaining.as_secs())]
    CoolingDown {
        channel: String,
        release: String,
        remaining: Duration,
    },

    #[error("{channel} failed to send {release}: {source}")]
    Delivery {
        channel: String,
        release: String,
        source: DeliveryError,
    },

    #[error("{channel} had no free slot for {release} within {}s", .timeout.as_secs())]
    SlotTimeout {
        channel: String,
        release: String,
        timeout: Duration,
    },

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, DispatchError::RateLimited { .. } | DispatchError::CoolingDown { .. })
    }
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Deliveries not attempted because their channel was halted.
    pub skipped: usize,
    pub errors: Vec<DispatchError>,
}

impl DispatchReport {
    pub fn rate_limited(&self) -> bool {
        self.errors.iter().any(DispatchError::is_rate_limit)
    }
}

struct ChannelSlot {
    channel: Arc<dyn NotificationChannel>,
    governor: RateGovernor,
}

pub struct DispatchManager {
    template: Template,
    settings: DispatchSettings,
    channels: Vec<ChannelSlot>,
}

impl DispatchManager {
    pub fn new(template: Template, settings: DispatchSettings) -> Self {
        Self {
            template,
            settings,
            channels: Vec::new(),
        }
    }

    pub fn add_channel(&mut self, channel: Arc<dyn NotificationChannel>, governor: RateGovernor) {
        info!("Enabled notification channel {}", channel.name());
        self.channels.push(ChannelSlot { channel, governor });
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|slot| slot.channel.name()).collect()
    }

    pub fn governor(&self, channel: &str) -> Option<&RateGovernor> {
        self.channels
            .iter()
            .find(|slot| slot.channel.name() == channel)
            .map(|slot| &slot.governor)
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Sends every release to every channel. Errors are collected, never
    /// raised; a cancelled run returns what was done so far.
    #[instrument(skip_all, fields(releases = releases.len(), channels = self.channels.len()))]
    pub async fn dispatch_all(&self, releases: &[ReleaseInfo], cancel: &CancellationToken) -> DispatchReport {
        let mut report = DispatchReport::default();
        if releases.is_empty() {
            return report;
        }
        if self.channels.is_empty() {
            warn!("No notification channel is enabled; {} releases not sent", releases.len());
            return report;
        }

        let mut halted = vec![false; self.channels.len()];
        let batch_size = self.settings.batch_size.max(1);
        info!("Sending {} releases to {} channels", releases.len(), self.channels.len());

        'batches: for (batch_index, batch) in releases.chunks(batch_size).enumerate() {
            for release in batch {
                let body = self.template.render(release);
                for (slot, halted) in self.channels.iter().zip(halted.iter_mut()) {
                    if *halted {
                        report.skipped += 1;
                        crate::metrics::dispatch::skipped(slot.channel.name());
                        continue;
                    }
                    match self.deliver_one(slot, release, &body, cancel).await {
                        Ok(()) => report.delivered += 1,
                        Err(DispatchError::Cancelled) => {
                            report.errors.push(DispatchError::Cancelled);
                            break 'batches;
                        }
                        Err(e) => {
                            if e.is_rate_limit() {
                                warn!("Skipping remaining deliveries to {} for this run", slot.channel.name());
                                *halted = true;
                            }
                            report.errors.push(e);
                        }
                    }
                }
            }

            let sent = ((batch_index + 1) * batch_size).min(releases.len());
            if sent < releases.len() {
                info!("Sent {}/{} releases ({}%)", sent, releases.len(), sent * 100 / releases.len());
                if !pause(self.settings.batch_pause, cancel).await {
                    report.errors.push(DispatchError::Cancelled);
                    break;
                }
            }
        }

        info!(
            delivered = report.delivered,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Dispatch finished"
        );
        report
    }

    async fn deliver_one(
        &self,
        slot: &ChannelSlot,
        release: &ReleaseInfo,
        body: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let channel = slot.channel.name();
        let label = format!("{} {}", release.identity, release.tag_name);

        // Fail fast rather than block on a cooldown we cannot outwait
        if let Some(remaining) = slot.governor.cooldown_remaining() {
            if remaining > self.settings.acquire_timeout {
                crate::metrics::dispatch::skipped(channel);
                return Err(DispatchError::CoolingDown {
                    channel: channel.to_string(),
                    release: label,
                    remaining,
                });
            }
        }

        match tokio::time::timeout(self.settings.acquire_timeout, slot.governor.acquire(cancel)).await {
            Ok(Ok(())) => {}
            Ok(Err(GovernorError::Cancelled)) => return Err(DispatchError::Cancelled),
            Err(_) => {
                crate::metrics::dispatch::delivery_error(channel);
                return Err(DispatchError::SlotTimeout {
                    channel: channel.to_string(),
                    release: label,
                    timeout: self.settings.acquire_timeout,
                });
            }
        }

        let t0 = Instant::now();
        let result = slot.channel.deliver(release, body).await;
        crate::metrics::dispatch::delivery_duration(channel, t0.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(()) => {
                debug!("Sent {} to {}", label, channel);
                crate::metrics::dispatch::delivered(channel);
                Ok(())
            }
            Err(e) if e.is_rate_limited() => {
                let cooldown = e.retry_after.unwrap_or_else(|| slot.channel.throttle_cooldown());
                slot.governor.report_throttled(cooldown);
                crate::metrics::dispatch::throttled(channel);
                Err(DispatchError::RateLimited {
                    channel: channel.to_string(),
                    release: label,
                    source: e,
                })
            }
            Err(e) => {
                warn!("Failed to send {} to {}: {}", label, channel, e);
                crate::metrics::dispatch::delivery_error(channel);
                Err(DispatchError::Delivery {
                    channel: channel.to_string(),
                    release: label,
                    source: e,
                })
            }
        };

        pause(self.settings.delivery_pause, cancel).await;
        outcome
    }
}

/// Sleeps for `duration`; false if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
