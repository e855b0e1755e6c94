//! Adaptive sampling.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use quanta::{Clock, Instant};
use tracing::debug;

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct State {
    target: u64,
    period: Duration,
    period_start: Instant,
    seen: u64,
    seen_last_period: u64,
    sampled: u64,
    threshold: f64,
}

impl State {
    fn roll_over(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.period_start);
        if elapsed < self.period {
            return;
        }

        if elapsed < self.period * 2 {
            // Aim for the target next period, assuming traffic stays the same.
            self.threshold = if self.seen == 0 {
                0.0
            } else {
                1.0 - (self.target as f64 / self.seen as f64).min(1.0)
            };
            self.seen_last_period = self.seen;
            self.period_start += self.period;
        } else {
            // A whole period went by without a single decision, so there is nothing to extrapolate from.
            self.threshold = 0.0;
            self.seen_last_period = 0;
            self.period_start = now;
        }

        debug!(
            seen = self.seen,
            sampled = self.sampled,
            threshold = self.threshold,
            "Adaptive sampler started a new period."
        );

        self.seen = 0;
        self.sampled = 0;
    }

    fn record_sampled(&mut self) {
        self.sampled += 1;
        if self.sampled < self.target {
            return;
        }

        if self.sampled >= self.target.saturating_mul(2) {
            self.threshold = 1.0;
            return;
        }

        // Past the target, back off exponentially for the rest of the period.
        let target = self.target as f64;
        let sampled = self.sampled as f64;
        let seen = self.seen_last_period.max(self.seen).max(1) as f64;
        let decayed = 1.0 - (target.powf(target / sampled) - target.sqrt()) / seen;
        self.threshold = decayed.clamp(0.0, 1.0);
    }
}

/// Samples up to a target number of traces per period.
///
/// Within a period, the sampler keeps every trace whose random roll clears the current threshold. The very first
/// period starts with a threshold of zero, so the first traces are always kept. Once the target is reached, the
/// threshold climbs exponentially, and once twice the target is reached, nothing else is sampled until the period
/// ends. At the start of each period, the threshold is reset so that the previous period's traffic would have
/// produced exactly the target.
///
/// Periods are tracked lazily: a new period begins on the first decision made after the current one has elapsed.
///
/// A single instance is usually shared by every decision point, so that the target applies to the whole process.
#[derive(Debug)]
pub struct AdaptiveSampler {
    clock: Clock,
    state: Mutex<State>,
}

impl AdaptiveSampler {
    /// Creates an adaptive sampler aiming for `target` sampled traces every `period`.
    pub fn new(target: u64, period: Duration) -> Self {
        Self::with_clock(target, period, Clock::new())
    }

    /// Creates an adaptive sampler measuring periods with the given clock.
    pub fn with_clock(target: u64, period: Duration, clock: Clock) -> Self {
        let period_start = clock.now();
        Self {
            clock,
            state: Mutex::new(State {
                target,
                period: period.max(MIN_PERIOD),
                period_start,
                seen: 0,
                seen_last_period: 0,
                sampled: 0,
                threshold: 0.0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of traces sampled per period this sampler aims for.
    pub fn sampling_target(&self) -> u64 {
        self.state().target
    }

    /// Returns the length of a sampling period.
    pub fn sampling_period(&self) -> Duration {
        self.state().period
    }

    /// Changes the target number of sampled traces per period.
    ///
    /// Counts for the current period are kept, so the new target takes effect immediately.
    pub fn update_target(&self, target: u64) {
        let mut state = self.state();
        debug!(previous = state.target, target, "Updating adaptive sampling target.");
        state.target = target;
    }

    /// Changes the length of a sampling period.
    ///
    /// The current period keeps its start, and ends once the new length has elapsed.
    pub fn update_period(&self, period: Duration) {
        let mut state = self.state();
        debug!(previous = ?state.period, ?period, "Updating adaptive sampling period.");
        state.period = period.max(MIN_PERIOD);
    }

    /// Decides whether the next trace is sampled.
    pub fn should_sample(&self) -> bool {
        self.should_sample_with_roll(rand::random::<f64>())
    }

    /// Decides whether the next trace is sampled, given a random roll in `[0, 1)`.
    ///
    /// Counting the trace and, if sampled, updating the threshold happen atomically.
    pub fn should_sample_with_roll(&self, roll: f64) -> bool {
        let now = self.clock.now();
        let mut state = self.state();
        state.roll_over(now);

        state.seen += 1;
        if state.target == 0 || roll < state.threshold {
            return false;
        }

        state.record_sampled();
        true
    }
}
