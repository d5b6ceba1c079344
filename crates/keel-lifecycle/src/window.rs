use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::clock::Clock;

pub const DEFAULT_ERROR_THRESHOLD: usize = 3;
pub const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Sliding window of recent error instants deciding the BROKEN transition:
/// `threshold` errors inside `window` are terminal.
#[derive(Debug, Clone)]
pub struct ErrorWindow<C: Clock> {
    clock: C,
    errors: VecDeque<Instant>,
    threshold: usize,
    window: Duration,
}

impl<C: Clock> ErrorWindow<C> {
    pub fn new(clock: C) -> Self {
        Self::with_limits(clock, DEFAULT_ERROR_THRESHOLD, DEFAULT_ERROR_WINDOW)
    }

    pub fn with_limits(clock: C, threshold: usize, window: Duration) -> Self {
        ErrorWindow {
            clock,
            errors: VecDeque::with_capacity(threshold),
            threshold,
            window,
        }
    }

    /// Record one error; returns true when the threshold is reached inside
    /// the window (the component is now broken).
    pub fn record(&mut self) -> bool {
        let now = self.clock.now();
        self.errors.push_back(now);
        while self.errors.len() > self.threshold {
            self.errors.pop_front();
        }
        self.errors.len() == self.threshold
            && now.duration_since(*self.errors.front().expect("non-empty")) <= self.window
    }

    /// Errors inside the window right now; drives restart back-off.
    pub fn recent(&self) -> usize {
        let now = self.clock.now();
        self.errors
            .iter()
            .filter(|t| now.duration_since(**t) <= self.window)
            .count()
    }

    pub fn reset(&mut self) {
        self.errors.clear();
    }
}
