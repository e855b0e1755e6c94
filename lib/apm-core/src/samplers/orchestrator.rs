use std::{sync::Arc, time::Duration};

use quanta::Clock;
use serde::Serialize;
use tracing::{debug, trace};

use super::{
    telemetry, AdaptiveSampler, DecisionPoint, Granularity, Sampler, SamplerConfigError, SamplerSpec, SamplingContext,
    SamplingDecision, TraceIdRatioBasedSampler,
};
use crate::{config::TracingConfiguration, distributed::Traceparent};

/// Marker set on transactions whose sampling involved the partial-granularity samplers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialType {
    /// Only the essential parts of the trace are kept.
    Essential,
}

impl PartialType {
    /// Returns the name of this partial type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Essential => "essential",
        }
    }
}

/// Sampling fields of a transaction.
///
/// All fields start unset. Exactly one decision fills them in, after which they never change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SamplingState {
    /// Priority of the trace.
    pub priority: Option<f64>,

    /// Whether the trace is kept.
    pub sampled: Option<bool>,

    /// Set when partial granularity took part in the decision.
    pub partial_type: Option<PartialType>,
}

impl SamplingState {
    /// Returns `true` once a sampling decision has been applied.
    pub const fn is_decided(&self) -> bool {
        self.priority.is_some()
    }

    fn set(&mut self, decision: SamplingDecision, partial_type: Option<PartialType>) {
        self.priority = Some(decision.priority);
        self.sampled = Some(decision.sampled);
        self.partial_type = partial_type;
    }
}

/// Something that receives a sampling decision.
pub trait SamplingSubject {
    /// Returns the trace identifier the decision is keyed on.
    fn trace_id(&self) -> &str;

    /// Returns the sampling fields.
    fn sampling_state(&self) -> &SamplingState;

    /// Returns the sampling fields, mutably.
    fn sampling_state_mut(&mut self) -> &mut SamplingState;
}

/// One sampler per decision point, for a single granularity.
#[derive(Clone, Debug)]
pub struct SamplerSet {
    root: Sampler,
    remote_parent_sampled: Sampler,
    remote_parent_not_sampled: Sampler,
}

impl SamplerSet {
    /// Returns the sampler for the given decision point.
    pub const fn get(&self, point: DecisionPoint) -> &Sampler {
        match point {
            DecisionPoint::Root => &self.root,
            DecisionPoint::RemoteParentSampled => &self.remote_parent_sampled,
            DecisionPoint::RemoteParentNotSampled => &self.remote_parent_not_sampled,
        }
    }

    /// Returns every decision point along with its sampler.
    pub fn iter(&self) -> impl Iterator<Item = (DecisionPoint, &Sampler)> {
        DecisionPoint::ALL.into_iter().map(move |point| (point, self.get(point)))
    }
}

struct SamplerFactory<'a> {
    shared: &'a Arc<AdaptiveSampler>,
    default_target: u64,
    default_period: Duration,
    clock: &'a Clock,
}

impl SamplerFactory<'_> {
    fn build(&self, spec: &SamplerSpec) -> Result<Sampler, SamplerConfigError> {
        spec.validate()?;

        let sampler = match spec {
            SamplerSpec::AlwaysOn => Sampler::AlwaysOn,
            SamplerSpec::AlwaysOff => Sampler::AlwaysOff,
            SamplerSpec::TraceIdRatioBased { ratio } => {
                Sampler::TraceIdRatioBased(TraceIdRatioBasedSampler::new(*ratio))
            }
            SamplerSpec::Adaptive(adaptive) if adaptive.is_shared() => Sampler::Adaptive(Arc::clone(self.shared)),
            SamplerSpec::Adaptive(adaptive) => {
                let target = match adaptive.sampling_target {
                    Some(target) => u64::try_from(target).map_err(|_| SamplerConfigError::InvalidTarget { target })?,
                    None => self.default_target,
                };
                let period = match adaptive.sampling_target_period_in_seconds {
                    Some(seconds) => Duration::try_from_secs_f64(seconds)
                        .map_err(|_| SamplerConfigError::InvalidPeriod { seconds })?,
                    None => self.default_period,
                };
                Sampler::Adaptive(Arc::new(AdaptiveSampler::with_clock(target, period, self.clock.clone())))
            }
        };
        Ok(sampler)
    }

    fn build_set(
        &self, root: &SamplerSpec, remote_parent_sampled: &SamplerSpec, remote_parent_not_sampled: &SamplerSpec,
    ) -> Result<SamplerSet, SamplerConfigError> {
        Ok(SamplerSet {
            root: self.build(root)?,
            remote_parent_sampled: self.build(remote_parent_sampled)?,
            remote_parent_not_sampled: self.build(remote_parent_not_sampled)?,
        })
    }
}

/// Makes sampling decisions for transactions.
///
/// Each decision consults the full-granularity sampler for the transaction's decision point first. If it declines and
/// partial granularity is enabled, the partial-granularity sampler for the same decision point gets a chance. The
/// first sampler to accept sets the priority band: 3.0 for full granularity, 2.0 for partial granularity. When no
/// sampler accepts, the priority is zero.
///
/// Decision points configured as plain `adaptive`, at either granularity, share one adaptive sampler so that the
/// process-wide target holds no matter where traces come from.
#[derive(Clone, Debug)]
pub struct Samplers {
    distributed_tracing_enabled: bool,
    full: Option<SamplerSet>,
    partial: Option<SamplerSet>,
    adaptive: Arc<AdaptiveSampler>,
}

impl Samplers {
    /// Creates the samplers described by `config`.
    ///
    /// # Errors
    ///
    /// If any sampler has out-of-range settings, an error is returned.
    pub fn new(config: &TracingConfiguration) -> Result<Self, SamplerConfigError> {
        Self::with_clock(config, Clock::new())
    }

    /// Creates the samplers described by `config`, with adaptive samplers measuring time using `clock`.
    ///
    /// # Errors
    ///
    /// If any sampler has out-of-range settings, an error is returned.
    pub fn with_clock(config: &TracingConfiguration, clock: Clock) -> Result<Self, SamplerConfigError> {
        let default_target = config.sampling_target();
        let default_period = config.sampling_target_period();
        let adaptive = Arc::new(AdaptiveSampler::with_clock(default_target, default_period, clock.clone()));

        let factory = SamplerFactory {
            shared: &adaptive,
            default_target,
            default_period,
            clock: &clock,
        };

        let sampler_config = config.sampler_configuration();
        let full = if sampler_config.full_granularity.enabled {
            Some(factory.build_set(
                &sampler_config.root,
                &sampler_config.remote_parent_sampled,
                &sampler_config.remote_parent_not_sampled,
            )?)
        } else {
            None
        };

        let partial_config = &sampler_config.partial_granularity;
        let partial = if partial_config.enabled {
            Some(factory.build_set(
                &partial_config.root,
                &partial_config.remote_parent_sampled,
                &partial_config.remote_parent_not_sampled,
            )?)
        } else {
            None
        };

        let samplers = Self {
            distributed_tracing_enabled: config.distributed_tracing_enabled(),
            full,
            partial,
            adaptive,
        };

        for (granularity, set) in samplers.enabled_sets() {
            for (point, sampler) in set.iter() {
                debug!(
                    granularity = granularity.as_str(),
                    decision_point = point.as_str(),
                    sampler = %sampler.kind(),
                    "Configured sampler."
                );
            }
        }

        Ok(samplers)
    }

    /// Returns `true` if distributed tracing is enabled.
    pub const fn distributed_tracing_enabled(&self) -> bool {
        self.distributed_tracing_enabled
    }

    /// Returns `true` if full-granularity samplers are consulted.
    pub const fn full_granularity_enabled(&self) -> bool {
        self.full.is_some()
    }

    /// Returns `true` if partial-granularity samplers are consulted.
    pub const fn partial_granularity_enabled(&self) -> bool {
        self.partial.is_some()
    }

    /// Returns the sampler for a decision point at the given granularity, if that granularity is enabled.
    pub fn sampler(&self, granularity: Granularity, point: DecisionPoint) -> Option<&Sampler> {
        self.set(granularity).map(|set| set.get(point))
    }

    /// Returns the process-wide adaptive sampler.
    pub fn adaptive_sampler(&self) -> &Arc<AdaptiveSampler> {
        &self.adaptive
    }

    fn set(&self, granularity: Granularity) -> Option<&SamplerSet> {
        match granularity {
            Granularity::Full => self.full.as_ref(),
            Granularity::Partial => self.partial.as_ref(),
        }
    }

    /// Returns every enabled granularity along with its samplers, full granularity first.
    pub(crate) fn enabled_sets(&self) -> impl Iterator<Item = (Granularity, &SamplerSet)> {
        [Granularity::Full, Granularity::Partial]
            .into_iter()
            .filter_map(move |granularity| self.set(granularity).map(|set| (granularity, set)))
    }

    /// Applies a sampling decision to a transaction that started a new trace.
    ///
    /// Does nothing if the transaction was already decided. With distributed tracing disabled, the transaction is
    /// not sampled and gets a random priority strictly between 0 and 1, which no sampler ever assigns.
    pub fn apply_sampling_decision<T>(&self, transaction: &mut T)
    where
        T: SamplingSubject + ?Sized,
    {
        if transaction.sampling_state().is_decided() {
            trace!("Transaction already has a sampling decision.");
            return;
        }

        if !self.distributed_tracing_enabled {
            let state = transaction.sampling_state_mut();
            state.sampled = Some(false);
            state.priority = Some(default_priority());
            return;
        }

        self.decide(DecisionPoint::Root, transaction);
    }

    /// Applies a sampling decision to a transaction continuing a remote trace.
    ///
    /// The decision point follows the remote parent's sampled flag. Without a traceparent, this is the same as
    /// [`apply_sampling_decision`][Self::apply_sampling_decision]. A missing transaction is tolerated.
    pub fn apply_dt_sampling_decision<T>(&self, transaction: Option<&mut T>, traceparent: Option<&Traceparent>)
    where
        T: SamplingSubject + ?Sized,
    {
        let Some(transaction) = transaction else {
            debug!("No transaction to apply distributed trace sampling decision to.");
            return;
        };

        match traceparent {
            Some(traceparent) if self.distributed_tracing_enabled => {
                if transaction.sampling_state().is_decided() {
                    trace!("Transaction already has a sampling decision.");
                    return;
                }
                self.decide(DecisionPoint::for_remote_parent(traceparent.is_sampled()), transaction);
            }
            _ => self.apply_sampling_decision(transaction),
        }
    }

    /// Applies a sampling decision to a transaction continuing a remote trace, given only the remote sampled flag.
    ///
    /// When the first sampler consulted for the decision point is adaptive, no decision is applied at all: adaptive
    /// sampling only runs through [`apply_dt_sampling_decision`][Self::apply_dt_sampling_decision] and
    /// [`apply_sampling_decision`][Self::apply_sampling_decision]. A missing transaction is tolerated.
    pub fn apply_legacy_dt_sampling_decision<T>(&self, transaction: Option<&mut T>, is_sampled: bool)
    where
        T: SamplingSubject + ?Sized,
    {
        let Some(transaction) = transaction else {
            debug!("No transaction to apply legacy distributed trace sampling decision to.");
            return;
        };

        if !self.distributed_tracing_enabled {
            self.apply_sampling_decision(transaction);
            return;
        }

        if transaction.sampling_state().is_decided() {
            trace!("Transaction already has a sampling decision.");
            return;
        }

        let point = DecisionPoint::for_remote_parent(is_sampled);
        let selected = self.full.as_ref().or(self.partial.as_ref()).map(|set| set.get(point));
        if selected.is_some_and(Sampler::is_adaptive) {
            debug!(
                decision_point = point.as_str(),
                "Skipping legacy sampling decision for adaptive sampler."
            );
            return;
        }

        self.decide(point, transaction);
    }

    fn decide<T>(&self, point: DecisionPoint, transaction: &mut T)
    where
        T: SamplingSubject + ?Sized,
    {
        let (decision, partial_type) = self.resolve(point, transaction.trace_id());
        transaction.sampling_state_mut().set(decision, partial_type);
    }

    fn resolve(&self, point: DecisionPoint, trace_id: &str) -> (SamplingDecision, Option<PartialType>) {
        if let Some(full) = &self.full {
            let decision = full.get(point).decide(&SamplingContext {
                trace_id,
                granularity: Granularity::Full,
            });
            if decision.sampled {
                return (decision, None);
            }
        }

        let Some(partial) = &self.partial else {
            return (not_sampled(), None);
        };

        let decision = partial.get(point).decide(&SamplingContext {
            trace_id,
            granularity: Granularity::Partial,
        });
        if decision.sampled {
            (decision, Some(PartialType::Essential))
        } else {
            (not_sampled(), Some(PartialType::Essential))
        }
    }

    /// Changes the target of the process-wide adaptive sampler.
    pub fn update_adaptive_target(&self, target: u64) {
        self.adaptive.update_target(target);
    }

    /// Changes the period of the process-wide adaptive sampler, in seconds.
    pub fn update_adaptive_period(&self, seconds: u64) {
        self.adaptive.update_period(Duration::from_secs(seconds));
    }

    /// Emits one supportability metric per enabled granularity and decision point, naming the sampler in use.
    pub fn send_core_tracing_metrics_on_connect(&self) {
        telemetry::emit_core_tracing_metrics(self);
    }
}

const fn not_sampled() -> SamplingDecision {
    SamplingDecision {
        sampled: false,
        priority: 0.0,
    }
}

fn default_priority() -> f64 {
    loop {
        let priority = rand::random::<f64>();
        if priority > 0.0 {
            return priority;
        }
    }
}
