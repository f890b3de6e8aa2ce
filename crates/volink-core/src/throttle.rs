//! Throttle with trailing delivery.
//!
//! A value scheduled outside the quiet period fires at once. A value
//! scheduled inside it replaces any pending value and fires when the period
//! ends, so the last value of a burst is never lost. Time is passed in
//! explicitly; the owner polls at its own tick rate.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Throttle<T> {
    period: Duration,
    last_fired: Option<Instant>,
    pending: Option<T>,
}

impl<T> Throttle<T> {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: None,
            pending: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Offer a value. Returns it back if it should be acted on now;
    /// otherwise it is held until `deadline()`.
    pub fn schedule(&mut self, value: T, now: Instant) -> Option<T> {
        if self.is_open(now) {
            self.pending = None;
            self.last_fired = Some(now);
            Some(value)
        } else {
            self.pending = Some(value);
            None
        }
    }

    /// Release the pending value once its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        if self.pending.is_some() && self.is_open(now) {
            self.last_fired = Some(now);
            return self.pending.take();
        }
        None
    }

    /// Release the pending value immediately, ignoring the deadline.
    pub fn flush(&mut self, now: Instant) -> Option<T> {
        let value = self.pending.take()?;
        self.last_fired = Some(now);
        Some(value)
    }

    /// Drop the pending value.
    pub fn cancel(&mut self) -> Option<T> {
        self.pending.take()
    }

    /// Forget the last firing so the next value goes straight through.
    pub fn reset(&mut self) {
        self.pending = None;
        self.last_fired = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending value will be released, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and(self.last_fired).map(|t| t + self.period)
    }

    fn is_open(&self, now: Instant) -> bool {
        match self.last_fired {
            Some(last) => now.saturating_duration_since(last) >= self.period,
            None => true,
        }
    }
}
