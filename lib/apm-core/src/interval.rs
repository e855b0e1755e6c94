//! Time interval arithmetic used for trace timing.

use std::time::Duration;

/// A half-open span of time `[start, end)`, expressed as offsets from the start of a trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval {
    start: Duration,
    end: Duration,
}

impl Interval {
    /// Creates an interval starting at `start` and lasting `duration`.
    pub fn from_start_and_duration(start: Duration, duration: Duration) -> Self {
        Self {
            start,
            end: start + duration,
        }
    }

    /// Returns the start offset.
    pub const fn start(&self) -> Duration {
        self.start
    }

    /// Returns the end offset.
    pub const fn end(&self) -> Duration {
        self.end
    }

    /// Returns the length of the interval.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A set of disjoint intervals, kept sorted by start offset.
///
/// Inserting overlapping or touching intervals merges them, so the total length of the set never counts the same
/// instant twice. The result of any sequence of insertions only depends on the intervals inserted, not their order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    /// Creates an empty set.
    pub const fn new() -> Self {
        Self { intervals: Vec::new() }
    }

    /// Adds an interval to the set.
    pub fn insert(&mut self, interval: Interval) {
        if interval.is_empty() {
            return;
        }

        // Every interval ending before the new one starts stays untouched, as does every interval starting after the
        // new one ends. Everything in between collapses into a single interval.
        let first = self.intervals.partition_point(|existing| existing.end < interval.start);
        let last = self.intervals.partition_point(|existing| existing.start <= interval.end);

        let mut merged = interval;
        if first < last {
            merged.start = merged.start.min(self.intervals[first].start);
            merged.end = merged.end.max(self.intervals[last - 1].end);
        }
        self.intervals.splice(first..last, std::iter::once(merged));
    }

    /// Merges every interval of `other` into this set.
    pub fn extend(&mut self, other: IntervalSet) {
        if self.intervals.is_empty() {
            self.intervals = other.intervals;
            return;
        }

        for interval in other.intervals {
            self.insert(interval);
        }
    }

    /// Returns the combined length of all intervals in the set.
    pub fn total(&self) -> Duration {
        self.intervals.iter().map(Interval::duration).sum()
    }

    /// Returns how much of `bounds` is covered by this set.
    pub fn covered_within(&self, bounds: Interval) -> Duration {
        self.intervals
            .iter()
            .filter_map(|interval| {
                let start = interval.start.max(bounds.start);
                let end = interval.end.min(bounds.end);
                (start < end).then(|| end - start)
            })
            .sum()
    }

    /// Returns `true` if the set holds no intervals.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Returns the disjoint intervals in ascending order.
    pub fn as_slice(&self) -> &[Interval] {
        &self.intervals
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn interval(start: u64, duration: u64) -> Interval {
        Interval::from_start_and_duration(ms(start), ms(duration))
    }

    #[test]
    fn disjoint_intervals_stay_separate() {
        let mut set = IntervalSet::new();
        set.insert(interval(500, 100));
        set.insert(interval(0, 100));

        assert_eq!(set.as_slice(), &[interval(0, 100), interval(500, 100)]);
        assert_eq!(set.total(), ms(200));
    }

    #[test]
    fn overlapping_and_touching_intervals_merge() {
        let mut set = IntervalSet::new();
        set.insert(interval(0, 100));
        set.insert(interval(100, 100));
        set.insert(interval(50, 300));
        set.insert(interval(1000, 10));

        assert_eq!(set.as_slice(), &[interval(0, 350), interval(1000, 10)]);
        assert_eq!(set.total(), ms(360));
    }

    #[test]
    fn bridging_interval_collapses_neighbors() {
        let mut set = IntervalSet::new();
        set.insert(interval(0, 10));
        set.insert(interval(20, 10));
        set.insert(interval(40, 10));
        set.insert(interval(5, 40));

        assert_eq!(set.as_slice(), &[interval(0, 50)]);
    }

    #[test]
    fn empty_intervals_are_ignored() {
        let mut set = IntervalSet::new();
        set.insert(interval(10, 0));
        assert!(set.is_empty());
        assert_eq!(set.total(), Duration::ZERO);
    }

    #[test]
    fn coverage_is_clipped_to_bounds() {
        let mut set = IntervalSet::new();
        set.insert(interval(0, 50));
        set.insert(interval(80, 100));

        assert_eq!(set.covered_within(interval(25, 100)), ms(25 + 45));
        assert_eq!(set.covered_within(interval(200, 10)), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn property_test_total_is_order_independent(
            raw in proptest::collection::vec((0u64..3_000, 0u64..1_000), 0..24),
        ) {
            let intervals: Vec<Interval> = raw.iter().map(|&(start, duration)| interval(start, duration)).collect();

            let mut forward = IntervalSet::new();
            intervals.iter().copied().for_each(|i| forward.insert(i));

            let mut backward = IntervalSet::new();
            intervals.iter().rev().copied().for_each(|i| backward.insert(i));

            prop_assert_eq!(&forward, &backward);

            // Brute force: count covered milliseconds directly.
            let covered = (0u64..4_000)
                .filter(|&t| intervals.iter().any(|i| i.start() <= ms(t) && ms(t) < i.end()))
                .count() as u64;
            prop_assert_eq!(forward.total(), ms(covered));
        }
    }
}
