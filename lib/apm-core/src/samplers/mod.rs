//! Sampling decisions.
//!
//! Every transaction gets exactly one sampling decision: whether its trace is kept, and with which priority. The
//! decision is made by one of several [`Sampler`] variants, picked by [`Samplers`] according to where the trace came
//! from (a fresh root, or a remote parent that was or was not sampled) and at which granularity.

use std::{fmt, sync::Arc};

mod adaptive;
pub use self::adaptive::AdaptiveSampler;

mod config;
pub use self::config::{
    AdaptiveSpec, FullGranularityConfiguration, PartialGranularityConfiguration, SamplerConfigError,
    SamplerConfiguration, SamplerSpec,
};

mod orchestrator;
pub use self::orchestrator::{PartialType, SamplerSet, SamplingState, SamplingSubject, Samplers};

mod ratio;
pub use self::ratio::TraceIdRatioBasedSampler;

mod telemetry;
pub use self::telemetry::core_tracing_metric_name;

/// Priority band of traces kept at full granularity.
pub const FULL_GRANULARITY_PRIORITY: f64 = 3.0;

/// Priority band of traces kept at partial granularity.
pub const PARTIAL_GRANULARITY_PRIORITY: f64 = 2.0;

/// Fidelity tier a sampler decides for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Granularity {
    /// Complete traces.
    Full,

    /// Reduced traces, used when the full-granularity sampler declines.
    Partial,
}

impl Granularity {
    /// Returns the priority assigned to traces sampled at this granularity.
    pub const fn priority(&self) -> f64 {
        match self {
            Self::Full => FULL_GRANULARITY_PRIORITY,
            Self::Partial => PARTIAL_GRANULARITY_PRIORITY,
        }
    }

    /// Returns the name used in supportability metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "FullGranularity",
            Self::Partial => "PartialGranularity",
        }
    }
}

/// Where a sampling decision is being made, based on the trace's origin.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DecisionPoint {
    /// The transaction started a new trace.
    Root,

    /// The transaction continues a trace whose remote parent was sampled.
    RemoteParentSampled,

    /// The transaction continues a trace whose remote parent was not sampled.
    RemoteParentNotSampled,
}

impl DecisionPoint {
    /// All decision points, in reporting order.
    pub const ALL: [DecisionPoint; 3] = [Self::Root, Self::RemoteParentSampled, Self::RemoteParentNotSampled];

    /// Returns the decision point for a remote parent with the given sampled flag.
    pub const fn for_remote_parent(parent_sampled: bool) -> Self {
        if parent_sampled {
            Self::RemoteParentSampled
        } else {
            Self::RemoteParentNotSampled
        }
    }

    /// Returns the name used in supportability metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "Root",
            Self::RemoteParentSampled => "RemoteParentSampled",
            Self::RemoteParentNotSampled => "RemoteParentNotSampled",
        }
    }
}

/// Input to a single sampling decision.
#[derive(Clone, Copy, Debug)]
pub struct SamplingContext<'a> {
    /// Trace identifier of the transaction being decided.
    pub trace_id: &'a str,

    /// Granularity the decision is made for.
    pub granularity: Granularity,
}

/// Outcome of a single sampling decision.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingDecision {
    /// Whether the trace is kept.
    pub sampled: bool,

    /// Priority of the trace. Sampled traces get their granularity's band; rejected traces get zero.
    pub priority: f64,
}

impl SamplingDecision {
    fn from_sampled(sampled: bool, granularity: Granularity) -> Self {
        Self {
            sampled,
            priority: if sampled { granularity.priority() } else { 0.0 },
        }
    }
}

/// Kind of a [`Sampler`], as reported in supportability metrics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SamplerKind {
    /// [`Sampler::AlwaysOn`].
    AlwaysOn,

    /// [`Sampler::AlwaysOff`].
    AlwaysOff,

    /// [`Sampler::TraceIdRatioBased`].
    TraceIdRatioBased,

    /// [`Sampler::Adaptive`].
    Adaptive,
}

impl SamplerKind {
    /// Returns the name used in supportability metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysOn => "AlwaysOn",
            Self::AlwaysOff => "AlwaysOff",
            Self::TraceIdRatioBased => "TraceIdRatioBased",
            Self::Adaptive => "Adaptive",
        }
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sampler bound to one decision point.
#[derive(Clone, Debug)]
pub enum Sampler {
    /// Samples every trace.
    AlwaysOn,

    /// Samples no trace.
    AlwaysOff,

    /// Samples a fixed fraction of traces, deterministically by trace identifier.
    TraceIdRatioBased(TraceIdRatioBasedSampler),

    /// Samples up to a target number of traces per period.
    ///
    /// The instance may be shared with other decision points, in which case they all count against the same target.
    Adaptive(Arc<AdaptiveSampler>),
}

impl Sampler {
    /// Decides whether the trace described by `context` is sampled.
    pub fn decide(&self, context: &SamplingContext<'_>) -> SamplingDecision {
        let sampled = match self {
            Self::AlwaysOn => true,
            Self::AlwaysOff => false,
            Self::TraceIdRatioBased(sampler) => sampler.should_sample(context.trace_id),
            Self::Adaptive(sampler) => sampler.should_sample(),
        };
        SamplingDecision::from_sampled(sampled, context.granularity)
    }

    /// Returns the kind of this sampler.
    pub const fn kind(&self) -> SamplerKind {
        match self {
            Self::AlwaysOn => SamplerKind::AlwaysOn,
            Self::AlwaysOff => SamplerKind::AlwaysOff,
            Self::TraceIdRatioBased(_) => SamplerKind::TraceIdRatioBased,
            Self::Adaptive(_) => SamplerKind::Adaptive,
        }
    }

    /// Returns `true` if this is an adaptive sampler.
    pub const fn is_adaptive(&self) -> bool {
        matches!(self, Self::Adaptive(_))
    }

    /// Returns the adaptive sampler instance, if this is an adaptive sampler.
    pub fn as_adaptive(&self) -> Option<&Arc<AdaptiveSampler>> {
        match self {
            Self::Adaptive(sampler) => Some(sampler),
            _ => None,
        }
    }
}
