use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use snafu::ResultExt as _;
use tracing::debug;

use super::{RemoteParent, Transaction, TransactionError, Trace};
use crate::{
    config::TracingConfiguration,
    distributed::{DistributedTracePayload, PayloadData, PayloadError, TraceContextHeaders, Traceparent, Tracestate},
    harvest::TransactionSink,
    samplers::Samplers,
    segment::{AttributeValue, Segment, SegmentId},
    trace::TraceError,
};

/// Everything a transaction needs from the tracer that created it.
pub(crate) struct TransactionServices {
    pub(crate) config: TracingConfiguration,
    pub(crate) samplers: Samplers,
    pub(crate) sink: Arc<dyn TransactionSink>,
}

impl TransactionServices {
    /// Makes sure the transaction has a sampling decision, continuing any remote trace it accepted.
    fn ensure_decided(&self, transaction: &mut Transaction) {
        if transaction.sampling.is_decided() {
            return;
        }

        match transaction.remote_traceparent() {
            Some(traceparent) => self
                .samplers
                .apply_dt_sampling_decision(Some(transaction), Some(&traceparent)),
            None => self.samplers.apply_sampling_decision(transaction),
        }
    }
}

/// Shared handle to a [`Transaction`].
///
/// Cloning is cheap; every clone refers to the same transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<Transaction>>,
    services: Arc<TransactionServices>,
}

impl TransactionHandle {
    pub(crate) fn new(transaction: Transaction, services: Arc<TransactionServices>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transaction)),
            services,
        }
    }

    /// Locks the transaction for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Transaction> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if both handles refer to the same transaction.
    pub fn ptr_eq(&self, other: &TransactionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the transaction identifier.
    pub fn id(&self) -> String {
        self.lock().id().to_string()
    }

    /// Returns the trace identifier.
    pub fn trace_id(&self) -> String {
        self.lock().trace_id().to_string()
    }

    /// Returns `true` once the transaction has ended.
    pub fn is_ended(&self) -> bool {
        self.lock().is_ended()
    }

    /// Returns a handle to the root segment.
    pub fn root_segment(&self) -> SegmentHandle {
        SegmentHandle {
            transaction: self.clone(),
            id: SegmentId::ROOT,
        }
    }

    /// Returns a handle to an existing segment of this transaction.
    ///
    /// # Errors
    ///
    /// If `id` does not belong to this transaction's trace, an error is returned.
    pub fn segment(&self, id: SegmentId) -> Result<SegmentHandle, TransactionError> {
        self.lock().trace().segment(id).context(Trace)?;
        Ok(SegmentHandle {
            transaction: self.clone(),
            id,
        })
    }

    /// Ends the transaction.
    ///
    /// The first call makes a sampling decision if none was made yet, stops the root segment, freezes the intrinsics
    /// and hands the transaction over to the harvester. Later calls do nothing. Returns `true` if this call ended the
    /// transaction.
    pub fn end(&self) -> bool {
        {
            let mut transaction = self.lock();
            if transaction.is_ended() {
                debug!(transaction_id = %transaction.id(), "Transaction already ended.");
                return false;
            }

            self.services.ensure_decided(&mut transaction);
            if let Err(e) = transaction.finalize(self.services.config.synthetics_enabled()) {
                debug!(transaction_id = %transaction.id(), error = %e, "Failed to stop root segment.");
            }
            transaction.ended = true;
        }

        self.services.sink.submit(self.clone());
        true
    }

    /// Continues the remote trace described by W3C trace context headers.
    ///
    /// The sampling decision is made right away, based on the remote parent's sampled flag. Headers are ignored when
    /// distributed tracing is disabled, when the transaction already continues a remote trace, or when no
    /// `traceparent` is present.
    ///
    /// # Errors
    ///
    /// If the `traceparent` header is malformed, an error is returned and the transaction is left untouched.
    pub fn accept_trace_context_headers(&self, headers: &TraceContextHeaders) -> Result<(), PayloadError> {
        let mut transaction = self.lock();
        if !self.can_accept(&transaction) {
            return Ok(());
        }

        let Some(raw) = headers.traceparent.as_deref() else {
            debug!(transaction_id = %transaction.id(), "No traceparent header to accept.");
            return Ok(());
        };

        let traceparent = match Traceparent::parse(raw) {
            Ok(traceparent) => traceparent,
            Err(e) => {
                debug!(transaction_id = %transaction.id(), error = %e, "Rejected trace context headers.");
                return Err(e);
            }
        };
        let tracestate = headers
            .tracestate
            .as_deref()
            .map(Tracestate::parse)
            .filter(|tracestate| !tracestate.is_empty());

        let parent = RemoteParent {
            span_id: Some(traceparent.parent_id().to_string()),
            sampled: Some(traceparent.is_sampled()),
            ..Default::default()
        };
        transaction.continue_remote_trace(traceparent.trace_id().to_string(), parent, tracestate);

        self.services
            .samplers
            .apply_dt_sampling_decision(Some(&mut *transaction), Some(&traceparent));
        Ok(())
    }

    /// Creates W3C trace context headers for an outbound call made from `segment`, or from the root segment.
    ///
    /// Makes the sampling decision first if none was made yet, so the outbound sampled flag is final. Returns empty
    /// headers when distributed tracing is disabled, or when `segment` does not belong to this transaction.
    pub fn create_trace_context_headers(&self, segment: Option<&SegmentHandle>) -> TraceContextHeaders {
        let mut transaction = self.lock();
        if !self.services.config.distributed_tracing_enabled() {
            return TraceContextHeaders::default();
        }

        let span_id = match self.outbound_span_id(&transaction, segment) {
            Ok(span_id) => span_id,
            Err(e) => {
                debug!(transaction_id = %transaction.id(), error = %e, "Not creating trace context headers.");
                return TraceContextHeaders::default();
            }
        };
        self.services.ensure_decided(&mut transaction);

        let trace_id = format!("{:0>32}", transaction.trace_id().to_ascii_lowercase());
        let traceparent = Traceparent::new(trace_id, span_id, transaction.sampled().unwrap_or(false));

        TraceContextHeaders {
            traceparent: Some(traceparent.to_string()),
            tracestate: transaction.tracestate().map(Tracestate::to_string),
        }
    }

    /// Continues the remote trace described by a JSON distributed trace payload.
    ///
    /// When the payload's sampled flag differs from the transaction's, the legacy sampling path decides, which may
    /// leave the transaction undecided until it ends. Payloads are ignored when distributed tracing is disabled, or
    /// when the transaction already continues a remote trace.
    ///
    /// # Errors
    ///
    /// If the payload is malformed, or comes from an account other than the trusted one, an error is returned and the
    /// transaction is left untouched.
    pub fn accept_distributed_trace_payload(&self, payload: &str) -> Result<(), PayloadError> {
        let mut transaction = self.lock();
        if !self.can_accept(&transaction) {
            return Ok(());
        }

        let payload = match DistributedTracePayload::parse(payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(transaction_id = %transaction.id(), error = %e, "Rejected distributed trace payload.");
                return Err(e);
            }
        };

        let data = payload.data;
        if let Some(trusted) = self.services.config.trusted_account_key() {
            let account = data.trusted_account_key.as_deref().unwrap_or(&data.account_id);
            if account != trusted {
                debug!(transaction_id = %transaction.id(), account, "Rejected distributed trace payload.");
                return Err(PayloadError::UntrustedAccount {
                    account: account.to_string(),
                });
            }
        }

        let sampled = data.sampled;
        let parent = RemoteParent {
            parent_type: Some(data.parent_type),
            account_id: Some(data.account_id),
            application_id: Some(data.application_id),
            span_id: data.span_id,
            transaction_id: data.transaction_id,
            sampled,
            timestamp: Some(data.timestamp),
        };
        transaction.continue_remote_trace(data.trace_id, parent, None);

        if let Some(sampled) = sampled {
            if transaction.sampled() != Some(sampled) {
                self.services
                    .samplers
                    .apply_legacy_dt_sampling_decision(Some(&mut *transaction), sampled);
            }
        }
        Ok(())
    }

    /// Creates a JSON distributed trace payload for an outbound call made from `segment`, or from the root segment.
    ///
    /// Makes the sampling decision first if none was made yet. Returns `None` when distributed tracing is disabled,
    /// when the account and application identity is not configured, or when `segment` does not belong to this
    /// transaction.
    pub fn create_distributed_trace_payload(&self, segment: Option<&SegmentHandle>) -> Option<DistributedTracePayload> {
        let config = &self.services.config;
        if !config.distributed_tracing_enabled() {
            return None;
        }
        let (Some(account_id), Some(application_id)) = (config.account_id(), config.primary_application_id()) else {
            debug!("Account and application identifiers are not configured. Not creating distributed trace payload.");
            return None;
        };

        let mut transaction = self.lock();
        let span_id = match self.outbound_span_id(&transaction, segment) {
            Ok(span_id) => span_id,
            Err(e) => {
                debug!(transaction_id = %transaction.id(), error = %e, "Not creating distributed trace payload.");
                return None;
            }
        };
        self.services.ensure_decided(&mut transaction);

        let trusted_account_key = config
            .trusted_account_key()
            .filter(|key| *key != account_id)
            .map(str::to_string);

        Some(DistributedTracePayload::new(PayloadData {
            parent_type: "App".to_string(),
            account_id: account_id.to_string(),
            application_id: application_id.to_string(),
            span_id: Some(span_id),
            transaction_id: Some(transaction.id().to_string()),
            trace_id: transaction.trace_id().to_string(),
            priority: transaction.priority(),
            sampled: transaction.sampled(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            trusted_account_key,
        }))
    }

    fn can_accept(&self, transaction: &Transaction) -> bool {
        if !self.services.config.distributed_tracing_enabled() {
            debug!(transaction_id = %transaction.id(), "Distributed tracing disabled. Ignoring inbound trace context.");
            return false;
        }
        if transaction.remote_parent().is_some() {
            debug!(transaction_id = %transaction.id(), "Transaction already continues a remote trace.");
            return false;
        }
        true
    }

    /// Returns the span identifier of `segment`, or of the root segment when `segment` is `None`.
    ///
    /// `transaction` must be this handle's locked transaction.
    fn outbound_span_id(
        &self, transaction: &Transaction, segment: Option<&SegmentHandle>,
    ) -> Result<String, TraceError> {
        let id = match segment {
            None => SegmentId::ROOT,
            Some(segment) if segment.transaction.ptr_eq(self) => segment.id,
            Some(segment) => return Err(TraceError::UnknownSegment { id: segment.id }),
        };
        Ok(transaction.trace().segment(id)?.span_id())
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transaction = self.lock();
        f.debug_struct("TransactionHandle")
            .field("id", &transaction.id())
            .field("trace_id", &transaction.trace_id())
            .field("ended", &transaction.is_ended())
            .finish()
    }
}

/// Handle to one segment of a transaction.
#[derive(Clone, Debug)]
pub struct SegmentHandle {
    transaction: TransactionHandle,
    id: SegmentId,
}

impl SegmentHandle {
    /// Returns the segment identifier.
    pub const fn id(&self) -> SegmentId {
        self.id
    }

    /// Returns the transaction this segment belongs to.
    pub const fn transaction(&self) -> &TransactionHandle {
        &self.transaction
    }

    /// Runs `f` with the segment.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn with_segment<F, R>(&self, f: F) -> Result<R, TransactionError>
    where
        F: FnOnce(&Segment) -> R,
    {
        let transaction = self.transaction.lock();
        let segment = transaction.trace().segment(self.id).context(Trace)?;
        Ok(f(segment))
    }

    /// Returns the segment name.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn name(&self) -> Result<String, TransactionError> {
        self.with_segment(|segment| segment.name().to_string())
    }

    /// Adds a child segment, not yet started.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn add_child<S: Into<String>>(&self, name: S) -> Result<SegmentHandle, TransactionError> {
        let id = self
            .transaction
            .lock()
            .trace_mut()
            .add_child(self.id, name)
            .context(Trace)?;
        Ok(SegmentHandle {
            transaction: self.transaction.clone(),
            id,
        })
    }

    /// Adds a child segment and starts it, unless the transaction has already ended.
    ///
    /// The check and the append happen under a single lock, so no segment is added once the transaction has been
    /// handed off. Returns `Ok(None)` if the transaction has ended.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn start_child<S: Into<String>>(&self, name: S) -> Result<Option<SegmentHandle>, TransactionError> {
        let mut transaction = self.transaction.lock();
        if transaction.is_ended() {
            return Ok(None);
        }

        let trace = transaction.trace_mut();
        let id = trace.add_child(self.id, name).context(Trace)?;
        trace.start(id).context(Trace)?;
        Ok(Some(SegmentHandle {
            transaction: self.transaction.clone(),
            id,
        }))
    }

    /// Starts the segment's timer.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn start(&self) -> Result<(), TransactionError> {
        self.transaction.lock().trace_mut().start(self.id).context(Trace)
    }

    /// Stops the segment's timer, returning its duration.
    ///
    /// # Errors
    ///
    /// If the segment was never started, an error is returned.
    pub fn end(&self) -> Result<Duration, TransactionError> {
        self.transaction.lock().trace_mut().end(self.id).context(Trace)
    }

    /// Marks the segment as in progress. See [`Segment::touch`].
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn touch(&self) -> Result<(), TransactionError> {
        self.transaction.lock().trace_mut().touch(self.id).context(Trace)
    }

    /// Sets an attribute on the segment.
    ///
    /// # Errors
    ///
    /// If this segment no longer belongs to its transaction's trace, an error is returned.
    pub fn add_attribute<K, V>(&self, key: K, value: V) -> Result<(), TransactionError>
    where
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        let mut transaction = self.transaction.lock();
        transaction
            .trace_mut()
            .segment_mut(self.id)
            .context(Trace)?
            .add_attribute(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        harvest::NoopSink,
        samplers::{PartialType, SamplerConfiguration, SamplingSubject as _},
        timer::TraceClock,
    };

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn services(config: TracingConfiguration, sink: Arc<dyn TransactionSink>) -> Arc<TransactionServices> {
        Arc::new(TransactionServices {
            samplers: Samplers::new(&config).unwrap(),
            config,
            sink,
        })
    }

    fn with_samplers(sampler: serde_json::Value) -> TracingConfiguration {
        let sampler: SamplerConfiguration = serde_json::from_value(sampler).unwrap();
        TracingConfiguration::default()
            .with_identity("33", "2827902")
            .with_sampler_configuration(sampler)
    }

    fn transaction(config: TracingConfiguration) -> TransactionHandle {
        TransactionHandle::new(
            Transaction::new(TraceClock::default()),
            services(config, Arc::new(NoopSink)),
        )
    }

    #[test]
    fn end_is_idempotent_and_hands_off_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = with_samplers(json!({ "root": "always_on" }));
        let handle = TransactionHandle::new(Transaction::new(TraceClock::default()), services(config, Arc::new(tx)));

        assert!(handle.end());
        assert!(!handle.end());
        assert!(handle.is_ended());

        let harvested = rx.try_recv().unwrap();
        assert!(harvested.ptr_eq(&handle));
        assert!(rx.try_recv().is_err());

        let transaction = harvested.lock();
        assert_eq!(transaction.priority(), Some(3.0));
        assert_eq!(transaction.sampled(), Some(true));
        assert!(transaction.trace().intrinsics().contains_key("totalTime"));
        assert!(!transaction.trace().root().timer().is_running());
    }

    #[test]
    fn end_keeps_existing_decision() {
        let handle = transaction(with_samplers(json!({ "root": "always_on" })));
        handle.lock().sampling_state_mut().priority = Some(0.5);
        handle.lock().sampling_state_mut().sampled = Some(false);

        handle.end();
        assert_eq!(handle.lock().priority(), Some(0.5));
        assert_eq!(handle.lock().sampled(), Some(false));
    }

    #[test]
    fn trace_context_headers_decide_immediately() {
        let handle = transaction(with_samplers(json!({
            "remote_parent_sampled": "always_off",
            "partial_granularity": { "enabled": true, "remote_parent_sampled": "always_on" },
        })));

        let headers = TraceContextHeaders {
            traceparent: Some(TRACEPARENT.to_string()),
            tracestate: Some("rojo=00f067aa0ba902b7".to_string()),
        };
        handle.accept_trace_context_headers(&headers).unwrap();

        let transaction = handle.lock();
        assert_eq!(transaction.trace_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(transaction.priority(), Some(2.0));
        assert_eq!(transaction.partial_type(), Some(PartialType::Essential));
        assert_eq!(
            transaction.remote_parent().and_then(|parent| parent.span_id.as_deref()),
            Some("00f067aa0ba902b7")
        );
        assert_eq!(transaction.tracestate().and_then(|state| state.get("rojo")), Some("00f067aa0ba902b7"));
    }

    #[test]
    fn malformed_headers_leave_transaction_untouched() {
        let handle = transaction(with_samplers(json!({})));
        let before = handle.trace_id();

        let headers = TraceContextHeaders {
            traceparent: Some("00-nope".to_string()),
            tracestate: None,
        };
        assert!(handle.accept_trace_context_headers(&headers).is_err());
        assert_eq!(handle.trace_id(), before);
        assert!(handle.lock().remote_parent().is_none());

        // Missing traceparent is not an error.
        handle
            .accept_trace_context_headers(&TraceContextHeaders::default())
            .unwrap();
        assert!(handle.lock().remote_parent().is_none());
    }

    #[test]
    fn outbound_headers_follow_decision() {
        let handle = transaction(with_samplers(json!({ "root": "always_off" })));
        let segment = handle.root_segment().add_child("http").unwrap();
        segment.start().unwrap();

        let headers = handle.create_trace_context_headers(Some(&segment));
        let traceparent = Traceparent::parse(headers.traceparent.as_deref().unwrap()).unwrap();

        assert_eq!(traceparent.trace_id(), handle.trace_id());
        assert_eq!(traceparent.parent_id(), segment.with_segment(Segment::span_id).unwrap());
        assert!(!traceparent.is_sampled());
        assert_eq!(headers.tracestate, None);
        assert_eq!(handle.lock().priority(), Some(0.0));
    }

    #[test]
    fn disabled_distributed_tracing_ignores_context() {
        let handle = transaction(with_samplers(json!({})).with_distributed_tracing_enabled(false));
        let headers = TraceContextHeaders {
            traceparent: Some(TRACEPARENT.to_string()),
            tracestate: None,
        };

        handle.accept_trace_context_headers(&headers).unwrap();
        assert!(handle.lock().remote_parent().is_none());
        assert_eq!(handle.create_trace_context_headers(None), TraceContextHeaders::default());
        assert!(handle.create_distributed_trace_payload(None).is_none());
    }

    fn payload(sampled: bool) -> String {
        json!({
            "v": [0, 1],
            "d": {
                "ty": "App",
                "ac": "33",
                "ap": "1234",
                "id": "7d3efb1b173fecfa",
                "tx": "e8b91a159289ff74",
                "tr": "d6b4ba0c3a712ca",
                "pr": 1.5,
                "sa": sampled,
                "ti": 1518469636035_i64,
            }
        })
        .to_string()
    }

    #[test]
    fn legacy_payload_with_adaptive_defers_to_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = with_samplers(json!({ "remote_parent_sampled": "adaptive" }));
        let handle = TransactionHandle::new(Transaction::new(TraceClock::default()), services(config, Arc::new(tx)));

        handle.accept_distributed_trace_payload(&payload(true)).unwrap();
        {
            let transaction = handle.lock();
            assert_eq!(transaction.trace_id(), "d6b4ba0c3a712ca");
            assert!(!transaction.sampling().is_decided());
        }

        // Ending consults the adaptive sampler, which keeps the first trace of a period.
        handle.end();
        let transaction = rx.try_recv().unwrap();
        let transaction = transaction.lock();
        assert_eq!(transaction.sampled(), Some(true));
        assert_eq!(transaction.priority(), Some(3.0));
        assert_eq!(transaction.trace().intrinsics()["parentId"], AttributeValue::from("e8b91a159289ff74"));
        assert_eq!(transaction.trace().intrinsics()["parent.account"], AttributeValue::from("33"));
    }

    #[test]
    fn legacy_payload_with_other_samplers_decides() {
        let handle = transaction(with_samplers(json!({ "remote_parent_not_sampled": "always_off" })));
        handle.accept_distributed_trace_payload(&payload(false)).unwrap();

        let transaction = handle.lock();
        assert_eq!(transaction.sampled(), Some(false));
        assert_eq!(transaction.priority(), Some(0.0));
    }

    #[test]
    fn untrusted_payload_is_rejected() {
        let handle = transaction(with_samplers(json!({})));
        let untrusted = payload(true).replace("\"ac\":\"33\"", "\"ac\":\"44\"");

        let error = handle.accept_distributed_trace_payload(&untrusted).unwrap_err();
        assert!(matches!(error, PayloadError::UntrustedAccount { account } if account == "44"));
        assert!(handle.lock().remote_parent().is_none());
    }

    #[test]
    fn only_first_remote_context_is_accepted() {
        let handle = transaction(with_samplers(json!({ "remote_parent_sampled": "always_on" })));
        handle.accept_distributed_trace_payload(&payload(true)).unwrap();
        handle.accept_distributed_trace_payload(&payload(false)).unwrap();

        assert_eq!(
            handle.lock().remote_parent().and_then(|parent| parent.sampled),
            Some(true)
        );
    }

    #[test]
    fn outbound_payload() {
        let handle = transaction(with_samplers(json!({ "root": "always_on" })));
        let payload = handle.create_distributed_trace_payload(None).unwrap();

        assert_eq!(payload.version, [0, 1]);
        assert_eq!(payload.data.account_id, "33");
        assert_eq!(payload.data.application_id, "2827902");
        assert_eq!(payload.data.trace_id, handle.trace_id());
        assert_eq!(payload.data.transaction_id, Some(handle.id()));
        assert_eq!(payload.data.priority, Some(3.0));
        assert_eq!(payload.data.sampled, Some(true));
        assert_eq!(payload.data.trusted_account_key, None);

        let unidentified = transaction(TracingConfiguration::default());
        assert!(unidentified.create_distributed_trace_payload(None).is_none());
    }

    #[test]
    fn segment_handles() {
        let handle = transaction(with_samplers(json!({})));
        let root = handle.root_segment();
        let child = root.add_child("db").unwrap();

        assert!(child.end().is_err());
        child.start().unwrap();
        child.add_attribute("sql", "SELECT 1").unwrap();
        child.end().unwrap();

        assert_eq!(child.name().unwrap(), "db");
        assert_eq!(handle.segment(child.id()).unwrap().id(), child.id());
        assert!(handle.segment(SegmentId(99)).is_err());
        assert_eq!(
            child.with_segment(|segment| segment.attributes()["sql"].clone()).unwrap(),
            AttributeValue::from("SELECT 1")
        );
    }

    #[test]
    fn unknown_segment_handles_are_errors() {
        let handle = transaction(with_samplers(json!({ "root": "always_on" })));
        let stale = SegmentHandle {
            transaction: handle.clone(),
            id: SegmentId(42),
        };

        assert!(matches!(
            stale.with_segment(Segment::span_id),
            Err(TransactionError::Trace {
                source: TraceError::UnknownSegment { .. }
            })
        ));
        assert!(stale.name().is_err());
        assert_eq!(handle.create_trace_context_headers(Some(&stale)), TraceContextHeaders::default());
        assert!(handle.create_distributed_trace_payload(Some(&stale)).is_none());

        // Nothing was decided on the way out.
        assert!(!handle.lock().sampling().is_decided());
    }

    #[test]
    fn segments_from_other_transactions_are_rejected() {
        let handle = transaction(with_samplers(json!({})));
        let other = transaction(with_samplers(json!({})));
        let foreign = other.root_segment();

        assert_eq!(handle.create_trace_context_headers(Some(&foreign)), TraceContextHeaders::default());
        assert!(handle.create_distributed_trace_payload(Some(&foreign)).is_none());
        assert!(handle.create_trace_context_headers(None).traceparent.is_some());
    }

    #[test]
    fn start_child_stops_once_ended() {
        let handle = transaction(with_samplers(json!({})));
        let root = handle.root_segment();

        let child = root.start_child("db").unwrap().unwrap();
        assert!(child.with_segment(|segment| segment.timer().is_running()).unwrap());
        assert_eq!(child.with_segment(Segment::parent).unwrap(), Some(SegmentId::ROOT));

        handle.end();
        assert!(root.start_child("late").unwrap().is_none());
        assert_eq!(handle.lock().trace().len(), 2);
    }

    struct RecordingSink {
        segments_at_submit: Mutex<Vec<usize>>,
    }

    impl TransactionSink for RecordingSink {
        fn submit(&self, transaction: TransactionHandle) {
            let len = transaction.lock().trace().len();
            self.segments_at_submit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(len);
        }
    }

    #[test]
    fn no_segment_is_added_after_hand_off() {
        let sink = Arc::new(RecordingSink {
            segments_at_submit: Mutex::new(Vec::new()),
        });
        let handle = TransactionHandle::new(
            Transaction::new(TraceClock::default()),
            services(with_samplers(json!({})), sink.clone()),
        );

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let root = handle.root_segment();
                std::thread::spawn(move || while root.start_child("worker").unwrap().is_some() {})
            })
            .collect();

        std::thread::sleep(Duration::from_millis(5));
        assert!(handle.end());
        for worker in workers {
            worker.join().unwrap();
        }

        let submitted = sink.segments_at_submit.lock().unwrap().clone();
        assert_eq!(submitted, [handle.lock().trace().len()]);
    }
}
