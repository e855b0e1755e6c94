//! Supportability metrics describing the sampler configuration.

use metrics::counter;

use super::{DecisionPoint, Granularity, SamplerKind, Samplers};

/// Returns the name of the supportability metric reporting `kind` as the sampler for a decision point.
///
/// Names take the form `Supportability/Tracing/{granularity}/{decision point}/{sampler}`, for example
/// `Supportability/Tracing/FullGranularity/Root/AlwaysOn`.
pub fn core_tracing_metric_name(granularity: Granularity, point: DecisionPoint, kind: SamplerKind) -> String {
    format!(
        "Supportability/Tracing/{}/{}/{}",
        granularity.as_str(),
        point.as_str(),
        kind.as_str()
    )
}

pub(super) fn emit_core_tracing_metrics(samplers: &Samplers) {
    for (granularity, set) in samplers.enabled_sets() {
        for (point, sampler) in set.iter() {
            counter!(core_tracing_metric_name(granularity, point, sampler.kind())).increment(1);
        }
    }
}
