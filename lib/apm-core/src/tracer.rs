//! Entry point tying configuration, samplers, context tracking and harvesting together.

use std::sync::Arc;

use apm_config::{GenericConfiguration, GenericError};
use quanta::Clock;
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::TracingConfiguration,
    context::{bind_to_context, ContextManager, SharedContextManager},
    harvest::{NoopSink, TransactionSink},
    samplers::{SamplerConfigError, Samplers},
    timer::TraceClock,
    transaction::{SegmentHandle, Transaction, TransactionError, TransactionHandle, TransactionServices},
};

/// Settings pushed by the collector when the agent connects.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ConnectResponse {
    /// New target of the process-wide adaptive sampler.
    #[serde(default)]
    pub sampling_target: Option<u64>,

    /// New period of the process-wide adaptive sampler, in seconds.
    #[serde(default)]
    pub sampling_target_period_in_seconds: Option<u64>,
}

/// Builder for [`Tracer`].
#[derive(Default)]
pub struct TracerBuilder {
    config: TracingConfiguration,
    sink: Option<Arc<dyn TransactionSink>>,
    context: Option<Arc<dyn ContextManager>>,
    clock: Option<Clock>,
}

impl TracerBuilder {
    /// Sets the tracing configuration.
    pub fn with_configuration(mut self, config: TracingConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Sets where ended transactions are handed off to.
    ///
    /// Defaults to discarding them.
    pub fn with_sink(mut self, sink: Arc<dyn TransactionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the context manager tracking the current segment.
    ///
    /// Defaults to a [`SharedContextManager`].
    pub fn with_context_manager(mut self, context: Arc<dyn ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the clock used for segment timing and adaptive sampling periods.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds the tracer.
    ///
    /// # Errors
    ///
    /// If any configured sampler has out-of-range settings, an error is returned.
    pub fn build(self) -> Result<Tracer, SamplerConfigError> {
        let clock = self.clock.unwrap_or_default();
        let samplers = Samplers::with_clock(&self.config, clock.clone())?;

        let services = Arc::new(TransactionServices {
            config: self.config,
            samplers,
            sink: self.sink.unwrap_or_else(|| Arc::new(NoopSink)),
        });
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(SharedContextManager::new()));

        Ok(Tracer {
            services,
            context,
            clock,
        })
    }
}

/// Creates transactions and segments, and tracks which one is current.
pub struct Tracer {
    services: Arc<TransactionServices>,
    context: Arc<dyn ContextManager>,
    clock: Clock,
}

impl Tracer {
    /// Returns a builder for a tracer with the default configuration.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// Creates a tracer from the given configuration, discarding ended transactions.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be extracted, or describes invalid samplers, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let config = TracingConfiguration::from_configuration(config)?;
        Ok(Self::builder().with_configuration(config).build()?)
    }

    /// Returns the tracing configuration.
    pub fn configuration(&self) -> &TracingConfiguration {
        &self.services.config
    }

    /// Returns the samplers.
    pub fn samplers(&self) -> &Samplers {
        &self.services.samplers
    }

    /// Returns the context manager.
    pub fn context_manager(&self) -> &Arc<dyn ContextManager> {
        &self.context
    }

    /// Starts a transaction, making its root segment the current segment.
    pub fn start_transaction<S: Into<String>>(&self, name: S) -> TransactionHandle {
        let transaction = Transaction::new(TraceClock::new(self.clock.clone()));
        self.activate(transaction, name.into())
    }

    /// Starts a transaction with the given identifiers, making its root segment the current segment.
    ///
    /// # Errors
    ///
    /// If either identifier is empty, an error is returned.
    pub fn start_transaction_with_ids<S, I, T>(
        &self, name: S, id: I, trace_id: T,
    ) -> Result<TransactionHandle, TransactionError>
    where
        S: Into<String>,
        I: Into<String>,
        T: Into<String>,
    {
        let transaction = Transaction::with_ids(id, trace_id, TraceClock::new(self.clock.clone()))?;
        Ok(self.activate(transaction, name.into()))
    }

    fn activate(&self, mut transaction: Transaction, name: String) -> TransactionHandle {
        debug!(transaction_id = %transaction.id(), trace_id = %transaction.trace_id(), name = %name, "Started transaction.");
        transaction.set_name(name);

        let handle = TransactionHandle::new(transaction, Arc::clone(&self.services));
        self.context.set_current_segment(Some(handle.root_segment()));
        handle
    }

    /// Returns the current transaction, if any.
    pub fn current_transaction(&self) -> Option<TransactionHandle> {
        self.context.current_transaction()
    }

    /// Returns the current segment, if any.
    pub fn current_segment(&self) -> Option<SegmentHandle> {
        self.context.current_segment()
    }

    /// Creates and starts a segment under the current segment.
    ///
    /// The current segment does not change. Returns `None` if there is no current transaction, or if it has ended.
    pub fn create_segment<S: Into<String>>(&self, name: S) -> Option<SegmentHandle> {
        let Some(parent) = self.context.current_segment() else {
            debug!("No current transaction. Not creating segment.");
            return None;
        };
        match parent.start_child(name) {
            Ok(Some(segment)) => Some(segment),
            Ok(None) => {
                debug!(transaction_id = %parent.transaction().id(), "Current transaction already ended. Not creating segment.");
                None
            }
            Err(e) => {
                debug!(transaction_id = %parent.transaction().id(), error = %e, "Failed to create segment.");
                None
            }
        }
    }

    /// Wraps `f` so that every call runs with `segment` as the current segment.
    pub fn bind<F, R>(&self, segment: Option<SegmentHandle>, f: F) -> impl Fn() -> R + Send + Sync
    where
        F: Fn() -> R + Send + Sync,
    {
        bind_to_context(Arc::clone(&self.context), segment, f)
    }

    /// Ends the current transaction and clears the current segment.
    ///
    /// Returns `true` if a transaction was ended by this call.
    pub fn end_current_transaction(&self) -> bool {
        let Some(transaction) = self.context.current_transaction() else {
            return false;
        };

        let ended = transaction.end();
        self.context.set_current_segment(None);
        ended
    }

    /// Applies settings pushed by the collector, then reports which samplers are in use.
    pub fn on_connect(&self, response: &ConnectResponse) {
        let samplers = &self.services.samplers;
        if let Some(target) = response.sampling_target {
            debug!(target, "Collector updated adaptive sampling target.");
            samplers.update_adaptive_target(target);
        }
        if let Some(period) = response.sampling_target_period_in_seconds {
            debug!(period_secs = period, "Collector updated adaptive sampling period.");
            samplers.update_adaptive_period(period);
        }

        samplers.send_core_tracing_metrics_on_connect();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use apm_config::ConfigurationLoader;
    use metrics_util::debugging::DebuggingRecorder;
    use serde_json::json;

    use super::*;

    #[test]
    fn start_transaction_sets_current() {
        let tracer = Tracer::builder().build().unwrap();
        assert!(tracer.current_transaction().is_none());

        let transaction = tracer.start_transaction("web");
        assert!(tracer.current_transaction().unwrap().ptr_eq(&transaction));
        assert_eq!(transaction.lock().name(), Some("web"));
        assert_eq!(tracer.current_segment().unwrap().name().unwrap(), "ROOT");
    }

    #[test]
    fn create_segment_needs_live_transaction() {
        let tracer = Tracer::builder().build().unwrap();
        assert!(tracer.create_segment("orphan").is_none());

        let transaction = tracer.start_transaction("web");
        let segment = tracer.create_segment("db").unwrap();
        assert!(segment.with_segment(|segment| segment.timer().is_running()).unwrap());
        assert_eq!(
            segment.with_segment(|segment| segment.parent()).unwrap(),
            Some(transaction.root_segment().id())
        );

        transaction.end();
        assert!(tracer.create_segment("late").is_none());
        assert_eq!(transaction.lock().trace().len(), 2);
    }

    #[test]
    fn end_current_transaction() {
        let tracer = Tracer::builder().build().unwrap();
        assert!(!tracer.end_current_transaction());

        let transaction = tracer.start_transaction("web");
        assert!(tracer.end_current_transaction());
        assert!(transaction.is_ended());
        assert!(tracer.current_transaction().is_none());
        assert!(!tracer.end_current_transaction());
    }

    #[test]
    fn explicit_ids() {
        let tracer = Tracer::builder().build().unwrap();
        let transaction = tracer.start_transaction_with_ids("web", "tx", "trace").unwrap();
        assert_eq!(transaction.id(), "tx");
        assert_eq!(transaction.trace_id(), "trace");

        let error = tracer.start_transaction_with_ids("web", "", "trace").unwrap_err();
        assert_eq!(error, TransactionError::MissingIdentity { field: "id" });
    }

    #[test]
    fn from_configuration() {
        let config = ConfigurationLoader::default()
            .from_values(json!({
                "distributed_tracing": { "sampler": { "root": "always_off" } },
                "sampling_target": 5,
            }))
            .into_generic();
        let tracer = Tracer::from_configuration(&config).unwrap();

        assert_eq!(tracer.configuration().sampling_target(), 5);
        assert_eq!(tracer.samplers().adaptive_sampler().sampling_target(), 5);
    }

    #[test]
    fn from_configuration_rejects_invalid_sampler() {
        let config = ConfigurationLoader::default()
            .from_values(json!({
                "distributed_tracing": { "sampler": { "root": { "trace_id_ratio_based": { "ratio": 2.0 } } } },
            }))
            .into_generic();
        assert!(Tracer::from_configuration(&config).is_err());
    }

    #[test]
    fn on_connect_updates_adaptive_sampler() {
        let tracer = Tracer::builder().build().unwrap();
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            tracer.on_connect(&ConnectResponse {
                sampling_target: Some(42),
                sampling_target_period_in_seconds: Some(30),
            });
        });

        let adaptive = tracer.samplers().adaptive_sampler();
        assert_eq!(adaptive.sampling_target(), 42);
        assert_eq!(adaptive.sampling_period(), Duration::from_secs(30));
        assert_eq!(snapshotter.snapshot().into_vec().len(), 3);
    }

    #[test]
    fn connect_response_shape() {
        let response: ConnectResponse = serde_json::from_value(json!({ "sampling_target": 7 })).unwrap();
        assert_eq!(
            response,
            ConnectResponse {
                sampling_target: Some(7),
                sampling_target_period_in_seconds: None,
            }
        );
    }
}
