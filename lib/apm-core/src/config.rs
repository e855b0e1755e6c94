//! Tracing configuration.

use std::time::Duration;

use apm_config::{GenericConfiguration, GenericError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::samplers::SamplerConfiguration;

const fn default_true() -> bool {
    true
}

const fn default_sampling_target() -> u64 {
    10
}

const fn default_sampling_target_period_in_seconds() -> u64 {
    60
}

/// Distributed tracing settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DistributedTracingConfiguration {
    /// Whether trace context is accepted from and propagated to other services, and samplers are consulted.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sampler settings.
    #[serde(default)]
    pub sampler: SamplerConfiguration,
}

impl Default for DistributedTracingConfiguration {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sampler: SamplerConfiguration::default(),
        }
    }
}

/// Synthetics settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SyntheticsConfiguration {
    /// Whether synthetics request details are copied into transaction intrinsics.
    ///
    /// Defaults to `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SyntheticsConfiguration {
    fn default() -> Self {
        Self { enabled: default_true() }
    }
}

/// Tracing configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TracingConfiguration {
    /// Distributed tracing settings.
    #[serde(default)]
    distributed_tracing: DistributedTracingConfiguration,

    /// Target number of sampled transactions per period for the process-wide adaptive sampler.
    ///
    /// Defaults to 10.
    #[serde(default = "default_sampling_target")]
    sampling_target: u64,

    /// Length of an adaptive sampling period, in seconds.
    ///
    /// Defaults to 60.
    #[serde(default = "default_sampling_target_period_in_seconds")]
    sampling_target_period_in_seconds: u64,

    /// Account reported in outbound trace context.
    #[serde(default)]
    account_id: Option<String>,

    /// Application reported in outbound trace context.
    #[serde(default)]
    primary_application_id: Option<String>,

    /// Account key trusted for inbound trace context. Defaults to the account.
    #[serde(default)]
    trusted_account_key: Option<String>,

    /// Synthetics settings.
    #[serde(default)]
    synthetics: SyntheticsConfiguration,
}

impl TracingConfiguration {
    /// Extracts the tracing configuration.
    ///
    /// # Errors
    ///
    /// If a key holds a value of the wrong type, or a sampler is not one of the recognized shapes, an error is
    /// returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let mut tracing = config.as_typed::<Self>()?;

        // Environment variables arrive as flat keys, such as `distributed_tracing_enabled`, which never reach the
        // nested sections above. Flat keys win over nested ones.
        overlay(config, "distributed_tracing_enabled", &mut tracing.distributed_tracing.enabled)?;

        let sampler = &mut tracing.distributed_tracing.sampler;
        overlay(config, "distributed_tracing_sampler_root", &mut sampler.root)?;
        overlay(
            config,
            "distributed_tracing_sampler_remote_parent_sampled",
            &mut sampler.remote_parent_sampled,
        )?;
        overlay(
            config,
            "distributed_tracing_sampler_remote_parent_not_sampled",
            &mut sampler.remote_parent_not_sampled,
        )?;
        overlay(
            config,
            "distributed_tracing_sampler_full_granularity_enabled",
            &mut sampler.full_granularity.enabled,
        )?;
        overlay(
            config,
            "distributed_tracing_sampler_partial_granularity_enabled",
            &mut sampler.partial_granularity.enabled,
        )?;

        overlay(config, "synthetics_enabled", &mut tracing.synthetics.enabled)?;

        Ok(tracing)
    }

    /// Returns `true` if distributed tracing is enabled.
    pub const fn distributed_tracing_enabled(&self) -> bool {
        self.distributed_tracing.enabled
    }

    /// Returns the sampler settings.
    pub const fn sampler_configuration(&self) -> &SamplerConfiguration {
        &self.distributed_tracing.sampler
    }

    /// Returns the target of the process-wide adaptive sampler.
    pub const fn sampling_target(&self) -> u64 {
        self.sampling_target
    }

    /// Returns the period of the process-wide adaptive sampler.
    pub const fn sampling_target_period(&self) -> Duration {
        Duration::from_secs(self.sampling_target_period_in_seconds)
    }

    /// Returns the account reported in outbound trace context.
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    /// Returns the application reported in outbound trace context.
    pub fn primary_application_id(&self) -> Option<&str> {
        self.primary_application_id.as_deref()
    }

    /// Returns the account key trusted for inbound trace context, falling back to the account.
    pub fn trusted_account_key(&self) -> Option<&str> {
        self.trusted_account_key.as_deref().or(self.account_id())
    }

    /// Returns `true` if synthetics details are recorded.
    pub const fn synthetics_enabled(&self) -> bool {
        self.synthetics.enabled
    }

    /// Enables or disables distributed tracing.
    pub fn with_distributed_tracing_enabled(mut self, enabled: bool) -> Self {
        self.distributed_tracing.enabled = enabled;
        self
    }

    /// Replaces the sampler settings.
    pub fn with_sampler_configuration(mut self, sampler: SamplerConfiguration) -> Self {
        self.distributed_tracing.sampler = sampler;
        self
    }

    /// Sets the target and period of the process-wide adaptive sampler.
    pub fn with_sampling_target(mut self, target: u64, period_in_seconds: u64) -> Self {
        self.sampling_target = target;
        self.sampling_target_period_in_seconds = period_in_seconds;
        self
    }

    /// Sets the identity reported in outbound trace context.
    pub fn with_identity<A, P>(mut self, account_id: A, primary_application_id: P) -> Self
    where
        A: Into<String>,
        P: Into<String>,
    {
        self.account_id = Some(account_id.into());
        self.primary_application_id = Some(primary_application_id.into());
        self
    }

    /// Enables or disables recording synthetics details.
    pub fn with_synthetics_enabled(mut self, enabled: bool) -> Self {
        self.synthetics.enabled = enabled;
        self
    }
}

impl Default for TracingConfiguration {
    fn default() -> Self {
        Self {
            distributed_tracing: DistributedTracingConfiguration::default(),
            sampling_target: default_sampling_target(),
            sampling_target_period_in_seconds: default_sampling_target_period_in_seconds(),
            account_id: None,
            primary_application_id: None,
            trusted_account_key: None,
            synthetics: SyntheticsConfiguration::default(),
        }
    }
}

fn overlay<T>(config: &GenericConfiguration, flat_key: &str, field: &mut T) -> Result<(), GenericError>
where
    T: DeserializeOwned,
{
    if let Some(value) = config.try_get_typed(flat_key)? {
        *field = value;
    }
    Ok(())
}
