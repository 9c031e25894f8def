//! Route expiry tracking.
//!
//! [`ExpiryTracker`] is pure: callers pass the current time in. The spawned
//! watch drives it on a tokio interval against the wall clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RouteConfig;

/// Quote window assumed by the progress bar.
const QUOTE_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryEvent {
    /// Within the refetch threshold; fired at most once.
    NearExpiry,
    /// Fired once when the route has expired.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRemaining {
    pub minutes: i64,
    pub seconds: i64,
    pub total_ms: i64,
}

impl TimeRemaining {
    const ZERO: Self = Self {
        minutes: 0,
        seconds: 0,
        total_ms: 0,
    };
}

/// Progress bar colour band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryZone {
    Fresh,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct ExpiryTracker {
    expiry: DateTime<Utc>,
    near_expiry_threshold: Duration,
    refetch_enabled: bool,
    near_fired: bool,
    expired_fired: bool,
}

impl ExpiryTracker {
    pub fn new(expiry: DateTime<Utc>, near_expiry_threshold: Duration) -> Self {
        Self {
            expiry,
            near_expiry_threshold,
            refetch_enabled: true,
            near_fired: false,
            expired_fired: false,
        }
    }

    /// Refetch is disabled while the user is signing.
    pub fn set_refetch_enabled(&mut self, enabled: bool) {
        self.refetch_enabled = enabled;
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now).num_milliseconds()
    }

    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<ExpiryEvent> {
        let remaining = self.remaining_ms(now);

        if remaining <= 0 {
            if self.expired_fired {
                return None;
            }
            self.expired_fired = true;
            return Some(ExpiryEvent::Expired);
        }

        let threshold = i64::try_from(self.near_expiry_threshold.as_millis()).unwrap_or(i64::MAX);
        if self.refetch_enabled && !self.near_fired && remaining <= threshold {
            self.near_fired = true;
            return Some(ExpiryEvent::NearExpiry);
        }

        None
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> TimeRemaining {
        let total_ms = self.remaining_ms(now);
        if total_ms <= 0 {
            return TimeRemaining::ZERO;
        }
        TimeRemaining {
            minutes: total_ms / 60_000,
            seconds: (total_ms % 60_000) / 1_000,
            total_ms,
        }
    }

    pub fn label(&self, now: DateTime<Utc>) -> String {
        let remaining = self.time_remaining(now);
        if remaining.total_ms <= 0 {
            return "Quote expired".to_string();
        }
        format!(
            "Price locked for {:02}:{:02}",
            remaining.minutes, remaining.seconds
        )
    }

    /// Elapsed share of a one minute window, clamped to 0..=100.
    pub fn progress_percent(&self, now: DateTime<Utc>) -> u8 {
        let elapsed = QUOTE_WINDOW_MS - self.time_remaining(now).total_ms;
        let pct = (elapsed.clamp(0, QUOTE_WINDOW_MS) * 100) / QUOTE_WINDOW_MS;
        u8::try_from(pct).unwrap_or(100)
    }

    pub fn zone(&self, now: DateTime<Utc>) -> ExpiryZone {
        match self.progress_percent(now) {
            0..70 => ExpiryZone::Fresh,
            70..85 => ExpiryZone::Warning,
            _ => ExpiryZone::Critical,
        }
    }
}

/// Run a tracker for `expiry` on a tokio interval, forwarding events to
/// `sink`. `refetch_enabled` is sampled on every tick.
///
/// The task ends after `Expired` is delivered or once the receiver is gone.
pub fn spawn_expiry_watch<F>(
    expiry: DateTime<Utc>,
    config: &RouteConfig,
    refetch_enabled: F,
    sink: mpsc::Sender<ExpiryEvent>,
) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    let mut tracker = ExpiryTracker::new(expiry, config.near_expiry_threshold);
    let tick = config.tick_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if sink.is_closed() {
                break;
            }

            tracker.set_refetch_enabled(refetch_enabled());
            let Some(event) = tracker.poll(Utc::now()) else {
                continue;
            };

            tracing::debug!(?event, expiry = %tracker.expiry(), "route expiry event");
            if sink.send(event).await.is_err() || event == ExpiryEvent::Expired {
                break;
            }
        }
    })
}
