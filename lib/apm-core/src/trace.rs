//! Traces: the call tree of a single transaction.

use std::time::Duration;

use serde::{
    ser::{SerializeMap as _, SerializeSeq as _, SerializeTuple as _},
    Serialize, Serializer,
};
use snafu::{ResultExt as _, Snafu};

use crate::{
    interval::IntervalSet,
    segment::{AttributeValue, Attributes, Segment, SegmentId},
    timer::{TimerError, TraceClock},
};

/// Maximum length, in bytes, of a string attribute value once serialized.
pub const MAX_ATTRIBUTE_VALUE_BYTES: usize = 255;

/// Maximum number of attributes serialized per segment.
pub const MAX_SEGMENT_ATTRIBUTES: usize = 64;

/// Maximum nesting depth of the serialized segment tree, counting the root as depth 0.
///
/// Segments nested deeper are left out of the serialized trace along with everything under them. At this depth the
/// nested arrays stay within the default nesting limit of `serde_json` readers.
pub const MAX_SERIALIZED_DEPTH: usize = 60;

/// A trace error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TraceError {
    /// A segment identifier did not belong to this trace.
    #[snafu(display("Segment {} does not exist in this trace.", id))]
    UnknownSegment {
        /// The unknown identifier.
        id: SegmentId,
    },

    /// A segment's timer rejected an operation.
    #[snafu(display("Invalid timer operation on segment {}.", id))]
    Timer {
        /// The segment whose timer failed.
        id: SegmentId,

        /// Error source.
        source: TimerError,
    },
}

/// The tree of segments recorded for one transaction.
///
/// Segments live in an arena owned by the trace and refer to each other by [`SegmentId`]. The root segment always
/// exists and is started when the trace is created.
#[derive(Clone, Debug)]
pub struct Trace {
    clock: TraceClock,
    segments: Vec<Segment>,
    intrinsics: Attributes,
}

impl Trace {
    /// Creates a trace with a root segment named `root_name`, started now.
    pub fn new<S: Into<String>>(root_name: S, clock: TraceClock) -> Self {
        let mut root = Segment::new(SegmentId::ROOT, None, root_name.into());
        root.timer_mut().start_at(clock.now());

        Self {
            clock,
            segments: vec![root],
            intrinsics: Attributes::new(),
        }
    }

    /// Returns the clock this trace measures time with.
    pub fn clock(&self) -> &TraceClock {
        &self.clock
    }

    /// Returns the root segment.
    pub fn root(&self) -> &Segment {
        &self.segments[SegmentId::ROOT.index()]
    }

    /// Returns the root segment, mutably.
    pub fn root_mut(&mut self) -> &mut Segment {
        &mut self.segments[SegmentId::ROOT.index()]
    }

    /// Returns the number of segments in the trace, including the root.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if the trace holds nothing but its root.
    pub fn is_empty(&self) -> bool {
        self.segments.len() == 1
    }

    /// Returns every segment, in the order they were added.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Looks up a segment.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn segment(&self, id: SegmentId) -> Result<&Segment, TraceError> {
        self.segments.get(id.index()).ok_or(TraceError::UnknownSegment { id })
    }

    /// Looks up a segment, mutably.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn segment_mut(&mut self, id: SegmentId) -> Result<&mut Segment, TraceError> {
        self.segments
            .get_mut(id.index())
            .ok_or(TraceError::UnknownSegment { id })
    }

    /// Returns the children of a segment, in the order they were added.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn get_children(&self, id: SegmentId) -> Result<Vec<&Segment>, TraceError> {
        let parent = self.segment(id)?;
        Ok(parent
            .child_ids()
            .iter()
            .map(|child| &self.segments[child.index()])
            .collect())
    }

    /// Adds a new, unstarted segment under `parent` and returns its identifier.
    ///
    /// # Errors
    ///
    /// If `parent` does not belong to this trace, an error is returned.
    pub fn add_child<S: Into<String>>(&mut self, parent: SegmentId, name: S) -> Result<SegmentId, TraceError> {
        let id = SegmentId(self.segments.len());
        self.segment_mut(parent)?.push_child(id);
        self.segments.push(Segment::new(id, Some(parent), name.into()));
        Ok(id)
    }

    /// Adds a new, unstarted segment directly under the root.
    pub fn add<S: Into<String>>(&mut self, name: S) -> SegmentId {
        let id = SegmentId(self.segments.len());
        self.root_mut().push_child(id);
        self.segments.push(Segment::new(id, Some(SegmentId::ROOT), name.into()));
        id
    }

    /// Starts a segment's timer now.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn start(&mut self, id: SegmentId) -> Result<(), TraceError> {
        let now = self.clock.now();
        self.segment_mut(id)?.timer_mut().start_at(now);
        Ok(())
    }

    /// Stops a segment's timer now, returning its duration.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, or the segment was never started, an error is returned.
    pub fn end(&mut self, id: SegmentId) -> Result<Duration, TraceError> {
        let now = self.clock.now();
        self.segment_mut(id)?.timer_mut().stop_at(now).context(Timer { id })
    }

    /// Touches a segment now. See [`Segment::touch`].
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn touch(&mut self, id: SegmentId) -> Result<(), TraceError> {
        let now = self.clock.now();
        self.segment_mut(id)?.touch(now);
        Ok(())
    }

    /// Returns the total time of the trace.
    ///
    /// Every segment contributes the part of its own interval not covered by any segment below it, so time spent by a
    /// parent waiting on its children is not counted twice, while work running in parallel branches is. Children that
    /// start before or end after their parent still contribute their full time. The result only depends on the tree's
    /// shape and on each segment's start offset and duration, not on the order in which segments were added.
    pub fn total_time(&self) -> Duration {
        let mut total = Duration::ZERO;
        self.for_each_with_descendant_coverage(|segment, descendants| {
            total += segment.total_time_duration(descendants);
        });
        total
    }

    /// Returns [`total_time`][Self::total_time] in milliseconds.
    pub fn total_time_millis(&self) -> f64 {
        self.total_time().as_secs_f64() * 1000.0
    }

    /// Visits every segment, deepest identifiers first, along with the merged coverage of all segments below it.
    ///
    /// Children are always added after their parent, so walking the arena backwards completes a subtree before its
    /// root is visited. Trees of any depth are handled without recursion.
    fn for_each_with_descendant_coverage<F>(&self, mut visit: F)
    where
        F: FnMut(&Segment, &IntervalSet),
    {
        let mut coverage = vec![IntervalSet::new(); self.segments.len()];
        for segment in self.segments.iter().rev() {
            let descendants = std::mem::take(&mut coverage[segment.id().index()]);
            visit(segment, &descendants);

            if let Some(parent) = segment.parent() {
                coverage[parent.index()].extend(segment.extend_coverage(descendants));
            }
        }
    }

    /// Returns the time a segment spent on its own, excluding any time covered by segments below it.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this trace, an error is returned.
    pub fn exclusive_duration(&self, id: SegmentId) -> Result<Duration, TraceError> {
        self.segment(id)?;

        let mut exclusive = Duration::ZERO;
        self.for_each_with_descendant_coverage(|segment, descendants| {
            if segment.id() == id {
                exclusive = segment.total_time_duration(descendants);
            }
        });
        Ok(exclusive)
    }

    /// Returns the trace-level intrinsic attributes.
    pub fn intrinsics(&self) -> &Attributes {
        &self.intrinsics
    }

    /// Returns the trace-level intrinsic attributes, mutably.
    pub fn intrinsics_mut(&mut self) -> &mut Attributes {
        &mut self.intrinsics
    }

    /// Returns a serializable view of the segment tree.
    ///
    /// Each segment becomes `[start_ms, end_ms, name, attributes, children]`. Segments below the root that were never
    /// started are left out along with everything under them, as are segments nested deeper than
    /// [`MAX_SERIALIZED_DEPTH`].
    pub fn serializable(&self) -> SerializedSegment<'_> {
        SerializedSegment {
            trace: self,
            id: SegmentId::ROOT,
            depth: 0,
        }
    }
}

/// Serializable view of a segment and its subtree.
pub struct SerializedSegment<'a> {
    trace: &'a Trace,
    id: SegmentId,
    depth: usize,
}

impl Serialize for SerializedSegment<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let segment = &self.trace.segments[self.id.index()];
        let timer = segment.timer();
        let start = timer.start_offset().unwrap_or_default();
        let end = timer.end_offset().unwrap_or(start);

        let mut tuple = serializer.serialize_tuple(5)?;
        tuple.serialize_element(&(start.as_secs_f64() * 1000.0))?;
        tuple.serialize_element(&(end.as_secs_f64() * 1000.0))?;
        tuple.serialize_element(segment.name())?;
        tuple.serialize_element(&LimitedAttributes(segment.attributes()))?;
        tuple.serialize_element(&SerializedChildren {
            trace: self.trace,
            parent: segment,
            depth: self.depth + 1,
        })?;
        tuple.end()
    }
}

struct SerializedChildren<'a> {
    trace: &'a Trace,
    parent: &'a Segment,
    depth: usize,
}

impl Serialize for SerializedChildren<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let touched = self
            .parent
            .child_ids()
            .iter()
            .filter(|id| self.trace.segments[id.index()].timer().is_touched());

        let mut seq = serializer.serialize_seq(None)?;
        if self.depth >= MAX_SERIALIZED_DEPTH {
            return seq.end();
        }

        for id in touched {
            seq.serialize_element(&SerializedSegment {
                trace: self.trace,
                id: *id,
                depth: self.depth,
            })?;
        }
        seq.end()
    }
}

struct LimitedAttributes<'a>(&'a Attributes);

impl Serialize for LimitedAttributes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len().min(MAX_SEGMENT_ATTRIBUTES)))?;
        for (key, value) in self.0.iter().take(MAX_SEGMENT_ATTRIBUTES) {
            match value {
                AttributeValue::String(s) => map.serialize_entry(key, truncate(s, MAX_ATTRIBUTE_VALUE_BYTES))?,
                other => map.serialize_entry(key, other)?,
            }
        }
        map.end()
    }
}

fn truncate(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }

    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
