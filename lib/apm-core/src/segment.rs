//! Segments: the nodes of a transaction's call tree.

use std::{fmt, time::Duration};

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    interval::{Interval, IntervalSet},
    timer::Timer,
};

/// Identifier of a segment, unique within its trace.
///
/// Identifiers are assigned sequentially as segments are added, starting with the root at zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct SegmentId(pub(crate) usize);

impl SegmentId {
    /// Identifier of the root segment of every trace.
    pub const ROOT: SegmentId = SegmentId(0);

    /// Returns the position of the segment in its trace's arena.
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scalar attribute value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string.
    String(String),

    /// A signed integer.
    Int(i64),

    /// A floating-point number.
    Float(f64),

    /// A boolean.
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Attributes attached to a segment or a trace, in insertion order.
pub type Attributes = IndexMap<String, AttributeValue>;

/// One timed unit of work within a trace.
#[derive(Clone, Debug)]
pub struct Segment {
    id: SegmentId,
    span_id: u64,
    parent: Option<SegmentId>,
    name: String,
    timer: Timer,
    attributes: Attributes,
    children: Vec<SegmentId>,
}

impl Segment {
    pub(crate) fn new(id: SegmentId, parent: Option<SegmentId>, name: String) -> Self {
        Self {
            id,
            span_id: rand::random(),
            parent,
            name,
            timer: Timer::new(),
            attributes: Attributes::new(),
            children: Vec::new(),
        }
    }

    /// Returns the identifier of this segment.
    pub const fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the span identifier used when this segment is the parent of a remote call, as 16 hex digits.
    pub fn span_id(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    /// Returns the parent of this segment, or `None` for the root.
    pub const fn parent(&self) -> Option<SegmentId> {
        self.parent
    }

    /// Returns the name of this segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames this segment.
    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = name.into();
    }

    /// Returns the identifiers of this segment's children, in the order they were added.
    pub fn child_ids(&self) -> &[SegmentId] {
        &self.children
    }

    pub(crate) fn push_child(&mut self, child: SegmentId) {
        self.children.push(child);
    }

    /// Returns the timer of this segment.
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Returns the timer of this segment, mutably.
    pub fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    /// Marks the segment as started at `now` and still in progress.
    ///
    /// An idle segment is started; a running one records its elapsed time so far. Touched segments are kept when the
    /// trace is serialized.
    pub fn touch(&mut self, now: Duration) {
        self.timer.touch_at(now);
    }

    /// Returns the attributes of this segment.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Returns the attributes of this segment, mutably.
    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Sets an attribute, replacing any previous value under the same key.
    pub fn add_attribute<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.attributes.insert(key.into(), value.into());
    }

    /// Returns the interval covered by this segment's own timer.
    pub fn interval(&self) -> Option<Interval> {
        self.timer.interval()
    }

    /// Merges this segment's own interval into the coverage of its descendants.
    pub fn extend_coverage(&self, descendant_coverage: IntervalSet) -> IntervalSet {
        let mut covered = descendant_coverage;
        if let Some(own) = self.interval() {
            covered.insert(own);
        }
        covered
    }

    /// Returns this segment's contribution to the total time of its trace.
    ///
    /// `descendant_coverage` is the merged time covered by every segment below this one. The contribution is the part
    /// of this segment's own interval that no descendant covers, which is also the segment's exclusive time.
    /// Descendants may start before or outlive this segment; that time is theirs to contribute. A leaf contributes its
    /// whole duration, and a segment fully covered by its descendants contributes nothing.
    pub fn total_time_duration(&self, descendant_coverage: &IntervalSet) -> Duration {
        match self.interval() {
            Some(own) => own.duration().saturating_sub(descendant_coverage.covered_within(own)),
            None => Duration::ZERO,
        }
    }
}
