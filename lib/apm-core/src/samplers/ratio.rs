//! Trace ID ratio-based sampling.

use std::hash::Hasher as _;

use fnv::FnvHasher;

/// Samples a fixed fraction of traces, keyed on the trace identifier.
///
/// The low 64 bits of the trace identifier are treated as a uniformly distributed number and compared against the
/// ratio, so every service configured with the same ratio reaches the same decision for the same trace.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceIdRatioBasedSampler {
    ratio: f64,
    upper_bound: u64,
}

impl TraceIdRatioBasedSampler {
    /// Creates a sampler keeping roughly `ratio` of all traces.
    ///
    /// Ratios outside of `[0, 1]` are clamped.
    pub fn new(ratio: f64) -> Self {
        let ratio = if ratio.is_nan() { 0.0 } else { ratio.clamp(0.0, 1.0) };
        Self {
            ratio,
            upper_bound: (ratio * (1u64 << 63) as f64) as u64,
        }
    }

    /// Returns the configured ratio.
    pub const fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Returns `true` if the trace with the given identifier should be sampled.
    pub fn should_sample(&self, trace_id: &str) -> bool {
        if self.ratio >= 1.0 {
            return true;
        }

        (trace_id_low_bits(trace_id) >> 1) < self.upper_bound
    }
}

/// Extracts the low 64 bits of a hex trace identifier.
///
/// Identifiers that are not hex are hashed instead, which keeps the decision deterministic.
fn trace_id_low_bits(trace_id: &str) -> u64 {
    let low = trace_id.len().checked_sub(16).and_then(|start| trace_id.get(start..));
    match low.map(|digits| u64::from_str_radix(digits, 16)) {
        Some(Ok(bits)) => bits,
        _ => hash_identifier(trace_id),
    }
}

fn hash_identifier(trace_id: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(trace_id.as_bytes());
    hasher.finish()
}
