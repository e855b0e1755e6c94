//! Sampler configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::Snafu;

/// A sampler configuration error.
#[derive(Debug, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SamplerConfigError {
    /// The configured sampler was not one of the recognized shapes.
    #[snafu(display(
        "Unrecognized sampler '{}'. Expected one of \"always_on\", \"always_off\", \"adaptive\", {{ trace_id_ratio_based: {{ ratio }} }} or {{ adaptive: {{ sampling_target, sampling_target_period_in_seconds }} }}.",
        value
    ))]
    UnrecognizedSampler {
        /// The offending value, rendered as JSON.
        value: String,
    },

    /// A trace ID ratio was missing, or outside of `[0, 1]`.
    #[snafu(display("Invalid trace ID ratio {}: must be a number between 0 and 1.", ratio))]
    InvalidRatio {
        /// The offending ratio.
        ratio: f64,
    },

    /// An adaptive sampling target was negative.
    #[snafu(display("Invalid adaptive sampling target {}: must not be negative.", target))]
    InvalidTarget {
        /// The offending target.
        target: i64,
    },

    /// An adaptive sampling period was not a positive number of seconds.
    #[snafu(display("Invalid adaptive sampling period {}s: must be positive.", seconds))]
    InvalidPeriod {
        /// The offending period, in seconds.
        seconds: f64,
    },
}

/// Adaptive sampler settings for a single decision point.
///
/// When neither field is set, the decision point uses the process-wide adaptive sampler.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveSpec {
    /// Target number of sampled traces per period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_target: Option<i64>,

    /// Period length, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_target_period_in_seconds: Option<f64>,
}

impl AdaptiveSpec {
    /// Returns `true` if this decision point uses the process-wide adaptive sampler.
    pub const fn is_shared(&self) -> bool {
        self.sampling_target.is_none() && self.sampling_target_period_in_seconds.is_none()
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RatioSpec {
    ratio: f64,
}

/// How a single decision point samples.
///
/// In configuration, this is either one of the strings `"always_on"`, `"always_off"` and `"adaptive"`, or an object
/// with a single key: `{ trace_id_ratio_based: { ratio } }` or `{ adaptive: { sampling_target,
/// sampling_target_period_in_seconds } }`. Anything else is rejected when the configuration is loaded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum SamplerSpec {
    /// Sample every trace.
    AlwaysOn,

    /// Sample no trace.
    AlwaysOff,

    /// Sample a fixed fraction of traces by trace identifier.
    TraceIdRatioBased {
        /// Fraction of traces to sample, in `[0, 1]`.
        ratio: f64,
    },

    /// Sample adaptively.
    Adaptive(AdaptiveSpec),
}

impl SamplerSpec {
    /// Checks that every numeric setting is within range.
    ///
    /// # Errors
    ///
    /// If a ratio, target or period is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), SamplerConfigError> {
        match self {
            Self::AlwaysOn | Self::AlwaysOff => Ok(()),
            Self::TraceIdRatioBased { ratio } => {
                if (0.0..=1.0).contains(ratio) {
                    Ok(())
                } else {
                    Err(SamplerConfigError::InvalidRatio { ratio: *ratio })
                }
            }
            Self::Adaptive(spec) => {
                if let Some(target) = spec.sampling_target.filter(|target| *target < 0) {
                    return Err(SamplerConfigError::InvalidTarget { target });
                }
                if let Some(seconds) = spec
                    .sampling_target_period_in_seconds
                    .filter(|seconds| !(seconds.is_finite() && *seconds > 0.0))
                {
                    return Err(SamplerConfigError::InvalidPeriod { seconds });
                }
                Ok(())
            }
        }
    }

    /// Parses a sampler from its configuration value.
    ///
    /// # Errors
    ///
    /// If the value has an unrecognized shape, or holds out-of-range settings, an error is returned.
    pub fn from_value(value: &Value) -> Result<Self, SamplerConfigError> {
        let unrecognized = || SamplerConfigError::UnrecognizedSampler {
            value: value.to_string(),
        };

        let spec = match value {
            Value::String(name) => match name.as_str() {
                "always_on" => Self::AlwaysOn,
                "always_off" => Self::AlwaysOff,
                "adaptive" => Self::Adaptive(AdaptiveSpec::default()),
                _ => return Err(unrecognized()),
            },
            Value::Object(map) if map.len() == 1 => match map.iter().next() {
                Some((key, inner)) if key == "trace_id_ratio_based" => {
                    let ratio = RatioSpec::deserialize(inner).map_err(|_| unrecognized())?;
                    if ratio.ratio.is_nan() {
                        return Err(SamplerConfigError::InvalidRatio { ratio: ratio.ratio });
                    }
                    Self::TraceIdRatioBased { ratio: ratio.ratio }
                }
                Some((key, inner)) if key == "adaptive" => {
                    Self::Adaptive(AdaptiveSpec::deserialize(inner).map_err(|_| unrecognized())?)
                }
                _ => return Err(unrecognized()),
            },
            _ => return Err(unrecognized()),
        };

        spec.validate()?;
        Ok(spec)
    }
}

impl Default for SamplerSpec {
    fn default() -> Self {
        Self::Adaptive(AdaptiveSpec::default())
    }
}

impl TryFrom<Value> for SamplerSpec {
    type Error = SamplerConfigError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(&value)
    }
}

impl From<SamplerSpec> for Value {
    fn from(spec: SamplerSpec) -> Self {
        let (key, inner) = match spec {
            SamplerSpec::AlwaysOn => return Value::from("always_on"),
            SamplerSpec::AlwaysOff => return Value::from("always_off"),
            SamplerSpec::Adaptive(adaptive) if adaptive.is_shared() => return Value::from("adaptive"),
            SamplerSpec::TraceIdRatioBased { ratio } => {
                let mut inner = Map::new();
                inner.insert("ratio".to_string(), Value::from(ratio));
                ("trace_id_ratio_based", Value::Object(inner))
            }
            SamplerSpec::Adaptive(adaptive) => {
                let mut inner = Map::new();
                if let Some(target) = adaptive.sampling_target {
                    inner.insert("sampling_target".to_string(), Value::from(target));
                }
                if let Some(seconds) = adaptive.sampling_target_period_in_seconds {
                    inner.insert("sampling_target_period_in_seconds".to_string(), Value::from(seconds));
                }
                ("adaptive", Value::Object(inner))
            }
        };

        let mut outer = Map::new();
        outer.insert(key.to_string(), inner);
        Value::Object(outer)
    }
}

const fn default_full_granularity_enabled() -> bool {
    true
}

/// Full-granularity settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FullGranularityConfiguration {
    /// Whether the full-granularity samplers are consulted at all.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_full_granularity_enabled")]
    pub enabled: bool,
}

impl Default for FullGranularityConfiguration {
    fn default() -> Self {
        Self {
            enabled: default_full_granularity_enabled(),
        }
    }
}

/// Partial-granularity settings.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PartialGranularityConfiguration {
    /// Whether the partial-granularity samplers are consulted when full granularity declines.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub enabled: bool,

    /// Sampler for new traces.
    #[serde(default)]
    pub root: SamplerSpec,

    /// Sampler for traces whose remote parent was sampled.
    #[serde(default)]
    pub remote_parent_sampled: SamplerSpec,

    /// Sampler for traces whose remote parent was not sampled.
    #[serde(default)]
    pub remote_parent_not_sampled: SamplerSpec,
}

/// Sampler settings for every decision point.
///
/// Each decision point defaults to the process-wide adaptive sampler.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SamplerConfiguration {
    /// Full-granularity sampler for new traces.
    #[serde(default)]
    pub root: SamplerSpec,

    /// Full-granularity sampler for traces whose remote parent was sampled.
    #[serde(default)]
    pub remote_parent_sampled: SamplerSpec,

    /// Full-granularity sampler for traces whose remote parent was not sampled.
    #[serde(default)]
    pub remote_parent_not_sampled: SamplerSpec,

    /// Full-granularity settings.
    #[serde(default)]
    pub full_granularity: FullGranularityConfiguration,

    /// Partial-granularity settings.
    #[serde(default)]
    pub partial_granularity: PartialGranularityConfiguration,
}
