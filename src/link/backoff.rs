//! Reconnection delays.
//!
//! [`Backoff`] computes how long to wait before the next connection attempt;
//! [`ReconnectScheduler`] owns the single outstanding retry timer.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;

use super::timer::ScheduledEvent;
use crate::config::ReconnectPolicy;

/// Growth factor applied after every failed attempt.
const MULTIPLIER: u32 = 2;

/// Floor for any retry delay; a zero base would never grow.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Backoff state for one link.
///
/// For the exponential policy the jitter added to a delay is kept below the
/// gap to the next base delay (`current * (MULTIPLIER - 1)`), so successive
/// delays never decrease, and every delay is capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = Self::initial_delay(&policy);
        Self { policy, current }
    }

    fn initial_delay(policy: &ReconnectPolicy) -> Duration {
        let delay = match policy {
            ReconnectPolicy::Exponential { initial, .. } => *initial,
            ReconnectPolicy::Fixed { delay } => *delay,
        };
        delay.max(MIN_DELAY)
    }

    /// Base delay the next attempt will start from, before jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return to the initial delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = Self::initial_delay(&self.policy);
    }

    /// Delay before the next attempt, advancing the state.
    pub fn next_delay(&mut self) -> Duration {
        match self.policy {
            ReconnectPolicy::Fixed { .. } => self.current,
            ReconnectPolicy::Exponential {
                max, max_jitter, ..
            } => {
                let jitter_bound = max_jitter
                    .min(self.current * (MULTIPLIER - 1))
                    .as_millis() as u64;
                let jitter = if jitter_bound == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_bound))
                };

                let delay = (self.current + jitter).min(max);
                self.current = (self.current * MULTIPLIER).min(max);
                delay
            }
        }
    }
}

/// Owns the reconnection timer; at most one is outstanding.
#[derive(Debug)]
pub(crate) struct ReconnectScheduler {
    backoff: Backoff,
    timer: Option<ScheduledEvent>,
    failed_attempts: u32,
}

impl ReconnectScheduler {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
            timer: None,
            failed_attempts: 0,
        }
    }

    /// Arm the retry timer unless one is already pending. Returns the delay
    /// when a new timer was started.
    pub(crate) fn schedule<T>(&mut self, tx: UnboundedSender<T>, event: T) -> Option<Duration>
    where
        T: Send + 'static,
    {
        if self.timer.is_some() {
            return None;
        }
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        let delay = self.backoff.next_delay();
        self.timer = Some(ScheduledEvent::start(delay, tx, event));
        Some(delay)
    }

    /// The timer fired; the attempt it triggers is about to start.
    pub(crate) fn fired(&mut self) {
        self.timer = None;
    }

    /// Drop any pending timer without touching the backoff.
    pub(crate) fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// A connection was established.
    pub(crate) fn connected(&mut self) {
        self.cancel();
        self.failed_attempts = 0;
        self.backoff.reset();
    }

    #[cfg(test)]
    pub(crate) fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn scheduled_delay(&self) -> Option<Duration> {
        self.timer.as_ref().map(ScheduledEvent::delay)
    }

    pub(crate) fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}
