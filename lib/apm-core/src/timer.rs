//! Segment timing.

use std::time::Duration;

use quanta::{Clock, Instant};
use snafu::Snafu;

use crate::interval::Interval;

/// A timer error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TimerError {
    /// The timer was stopped before it was ever started.
    #[snafu(display("Timer was stopped without having been started."))]
    NotStarted,

    /// An explicit duration was assigned to a timer that had already stopped.
    #[snafu(display("Timer has already stopped; its duration can no longer change."))]
    AlreadyStopped,
}

/// Monotonic time source for a single trace.
///
/// Offsets handed out are measured from the moment the clock was created, which is also the moment the owning trace
/// began. Cloning shares the underlying clock and epoch.
#[derive(Clone, Debug)]
pub struct TraceClock {
    clock: Clock,
    epoch: Instant,
}

impl TraceClock {
    /// Creates a trace clock whose epoch is the current instant of `clock`.
    pub fn new(clock: Clock) -> Self {
        let epoch = clock.now();
        Self { clock, epoch }
    }

    /// Returns the time elapsed since the epoch.
    pub fn now(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.epoch)
    }
}

impl Default for TraceClock {
    fn default() -> Self {
        Self::new(Clock::new())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum State {
    #[default]
    Idle,
    Running {
        start: Duration,
        elapsed: Option<Duration>,
    },
    Stopped {
        start: Duration,
        duration: Duration,
    },
}

/// A start/stop timer measured in offsets from the start of its trace.
///
/// A timer moves from idle, to running, to stopped. Once stopped, its duration never changes again.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Timer {
    state: State,
}

impl Timer {
    /// Creates an idle timer.
    pub const fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Starts the timer at `now`.
    ///
    /// Starting a timer that is already running or stopped has no effect.
    pub fn start_at(&mut self, now: Duration) {
        if let State::Idle = self.state {
            self.state = State::Running {
                start: now,
                elapsed: None,
            };
        }
    }

    /// Stops the timer at `now`, returning the final duration.
    ///
    /// Stopping an already-stopped timer returns the duration recorded the first time.
    ///
    /// # Errors
    ///
    /// If the timer was never started, an error is returned.
    pub fn stop_at(&mut self, now: Duration) -> Result<Duration, TimerError> {
        match self.state {
            State::Idle => Err(TimerError::NotStarted),
            State::Running { start, .. } => {
                let duration = now.saturating_sub(start);
                self.state = State::Stopped { start, duration };
                Ok(duration)
            }
            State::Stopped { duration, .. } => Ok(duration),
        }
    }

    /// Records the time elapsed so far without stopping, starting the timer first if it is idle.
    pub fn touch_at(&mut self, now: Duration) {
        match self.state {
            State::Idle => self.start_at(now),
            State::Running { start, .. } => {
                self.state = State::Running {
                    start,
                    elapsed: Some(now.saturating_sub(start)),
                }
            }
            State::Stopped { .. } => {}
        }
    }

    /// Assigns a start offset and a duration directly, leaving the timer stopped.
    ///
    /// # Errors
    ///
    /// If the timer has already stopped, an error is returned and the recorded duration is left unchanged.
    pub fn set_duration_from_offsets(&mut self, duration: Duration, start_offset: Duration) -> Result<(), TimerError> {
        if let State::Stopped { .. } = self.state {
            return Err(TimerError::AlreadyStopped);
        }

        self.state = State::Stopped {
            start: start_offset,
            duration,
        };
        Ok(())
    }

    /// Returns `true` if the timer was ever started or given an explicit duration.
    pub fn is_touched(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Returns `true` if the timer is started and not yet stopped.
    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Returns the start offset, if the timer was started.
    pub fn start_offset(&self) -> Option<Duration> {
        match self.state {
            State::Idle => None,
            State::Running { start, .. } | State::Stopped { start, .. } => Some(start),
        }
    }

    /// Returns the known duration.
    ///
    /// For a running timer, this is the elapsed time as of the last touch, if any.
    pub fn duration(&self) -> Option<Duration> {
        match self.state {
            State::Idle => None,
            State::Running { elapsed, .. } => elapsed,
            State::Stopped { duration, .. } => Some(duration),
        }
    }

    /// Returns the known duration in milliseconds.
    pub fn duration_millis(&self) -> Option<f64> {
        self.duration().map(|duration| duration.as_secs_f64() * 1000.0)
    }

    /// Returns the end offset, if both the start and the duration are known.
    pub fn end_offset(&self) -> Option<Duration> {
        Some(self.start_offset()? + self.duration()?)
    }

    /// Returns the interval covered by this timer, if both the start and the duration are known.
    pub fn interval(&self) -> Option<Interval> {
        Some(Interval::from_start_and_duration(self.start_offset()?, self.duration()?))
    }

    /// Returns `true` if this timer ends strictly after `other`.
    pub fn ends_after(&self, other: &Timer) -> bool {
        match (self.end_offset(), other.end_offset()) {
            (Some(ours), Some(theirs)) => ours > theirs,
            _ => false,
        }
    }

    /// Returns how long after `other` this timer started, or zero if it started first.
    pub fn start_relative_to(&self, other: &Timer) -> Option<Duration> {
        Some(self.start_offset()?.saturating_sub(other.start_offset()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn lifecycle() {
        let mut timer = Timer::new();
        assert!(!timer.is_touched());
        assert_eq!(timer.duration(), None);

        timer.start_at(ms(10));
        assert!(timer.is_touched());
        assert!(timer.is_running());
        assert_eq!(timer.duration(), None);

        timer.touch_at(ms(15));
        assert!(timer.is_running());
        assert_eq!(timer.duration(), Some(ms(5)));

        assert_eq!(timer.stop_at(ms(40)), Ok(ms(30)));
        assert!(!timer.is_running());
        assert_eq!(timer.start_offset(), Some(ms(10)));
        assert_eq!(timer.end_offset(), Some(ms(40)));
        assert_eq!(timer.duration_millis(), Some(30.0));
    }

    #[test]
    fn stopping_unstarted_timer_fails() {
        let mut timer = Timer::new();
        assert_eq!(timer.stop_at(ms(10)), Err(TimerError::NotStarted));
        assert!(!timer.is_touched());
    }

    #[test]
    fn duration_is_immutable_once_stopped() {
        let mut timer = Timer::new();
        timer.start_at(ms(0));
        timer.stop_at(ms(100)).unwrap();

        // A second stop, a restart, or a touch leave the recorded duration alone.
        assert_eq!(timer.stop_at(ms(500)), Ok(ms(100)));
        timer.start_at(ms(200));
        timer.touch_at(ms(900));
        assert_eq!(timer.duration(), Some(ms(100)));

        assert_eq!(
            timer.set_duration_from_offsets(ms(1), ms(1)),
            Err(TimerError::AlreadyStopped)
        );
        assert_eq!(timer.duration(), Some(ms(100)));
    }

    #[test]
    fn explicit_offsets() {
        let mut timer = Timer::new();
        timer.set_duration_from_offsets(ms(1000), ms(500)).unwrap();

        assert!(timer.is_touched());
        assert!(!timer.is_running());
        assert_eq!(timer.interval(), Some(Interval::from_start_and_duration(ms(500), ms(1000))));
    }

    #[test]
    fn touching_idle_timer_starts_it() {
        let mut timer = Timer::new();
        timer.touch_at(ms(7));
        assert!(timer.is_running());
        assert_eq!(timer.start_offset(), Some(ms(7)));
    }

    #[test]
    fn relative_comparisons() {
        let mut outer = Timer::new();
        outer.set_duration_from_offsets(ms(100), ms(0)).unwrap();
        let mut inner = Timer::new();
        inner.set_duration_from_offsets(ms(200), ms(50)).unwrap();

        assert!(inner.ends_after(&outer));
        assert!(!outer.ends_after(&inner));
        assert_eq!(inner.start_relative_to(&outer), Some(ms(50)));
        assert_eq!(outer.start_relative_to(&inner), Some(Duration::ZERO));
        assert!(!Timer::new().ends_after(&outer));
    }

    #[test]
    fn trace_clock_follows_mocked_time() {
        let (clock, mock) = Clock::mock();
        let trace_clock = TraceClock::new(clock);
        assert_eq!(trace_clock.now(), Duration::ZERO);

        mock.increment(ms(250));
        assert_eq!(trace_clock.now(), ms(250));
    }
}
