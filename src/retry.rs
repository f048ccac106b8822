//! Bounded retry-with-interval polling shared by every wait loop.
use std::{thread, time::Duration};

use tracing::trace;

/// How many times to evaluate a condition and how long to pause in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of evaluations. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between evaluations. Never slept after the final attempt.
    pub interval: Duration,
}

/// Result of a [`RetryPolicy::poll`] run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate returned `true` on attempt `attempts`.
    Satisfied { attempts: u32 },
    /// The predicate never held; `attempts` evaluations were made.
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { attempts } | PollOutcome::Exhausted { attempts } => {
                *attempts
            }
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Builds a policy that keeps checking every `step` for roughly `window`.
    ///
    /// The first check happens immediately, so a zero window still checks once.
    pub fn within(window: Duration, step: Duration) -> Self {
        if step.is_zero() {
            return Self::new(1, Duration::ZERO);
        }
        let steps = window.as_millis() / step.as_millis().max(1);
        let attempts = u32::try_from(steps).unwrap_or(u32::MAX).saturating_add(1);
        Self::new(attempts, step)
    }

    /// Evaluates `predicate` until it returns `true` or attempts run out.
    ///
    /// The predicate receives the 1-based attempt number.
    pub fn poll<F>(&self, mut predicate: F) -> PollOutcome
    where
        F: FnMut(u32) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if predicate(attempt) {
                return PollOutcome::Satisfied { attempts: attempt };
            }
            trace!("poll attempt {attempt}/{max_attempts} not satisfied");
            if attempt != max_attempts && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        PollOutcome::Exhausted {
            attempts: max_attempts,
        }
    }
}
