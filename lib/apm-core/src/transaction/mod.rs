//! Transactions: the root unit of monitored work.

use std::time::Duration;

use snafu::{ResultExt as _, Snafu};
use tracing::debug;

use crate::{
    distributed::{Traceparent, Tracestate},
    samplers::{PartialType, SamplingState, SamplingSubject},
    segment::{AttributeValue, SegmentId},
    timer::TraceClock,
    trace::{self, TraceError},
};

mod handle;
pub use self::handle::{SegmentHandle, TransactionHandle};
pub(crate) use self::handle::TransactionServices;

/// Name of the root segment of every transaction's trace.
pub const ROOT_SEGMENT_NAME: &str = "ROOT";

/// A transaction error.
#[derive(Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum TransactionError {
    /// A transaction was created without one of its identifiers.
    #[snafu(display("Transaction is missing its {}.", field))]
    MissingIdentity {
        /// Name of the missing identifier.
        field: &'static str,
    },

    /// An operation on the transaction's trace failed.
    #[snafu(display("Trace operation failed: {}", source))]
    Trace {
        /// Error source.
        source: TraceError,
    },
}

/// Details of a synthetic monitoring request.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyntheticsData {
    /// Identifier of the synthetic request.
    pub resource_id: String,

    /// Identifier of the synthetic job.
    pub job_id: String,

    /// Identifier of the synthetic monitor.
    pub monitor_id: String,
}

/// The upstream caller of a transaction that continues a remote trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteParent {
    /// Type of the caller, usually `App`.
    pub parent_type: Option<String>,

    /// Account of the caller.
    pub account_id: Option<String>,

    /// Application of the caller.
    pub application_id: Option<String>,

    /// Span identifier of the calling segment.
    pub span_id: Option<String>,

    /// Transaction identifier of the caller.
    pub transaction_id: Option<String>,

    /// Whether the caller sampled the trace, if known.
    pub sampled: Option<bool>,

    /// Creation time of the caller's trace context, in milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
}

/// A single unit of monitored work, such as one web request.
///
/// A transaction owns its trace and carries the trace's identity and sampling decision. It is usually manipulated
/// through a [`TransactionHandle`].
#[derive(Debug)]
pub struct Transaction {
    id: String,
    trace_id: String,
    name: Option<String>,
    trace: trace::Trace,
    sampling: SamplingState,
    synthetics: Option<SyntheticsData>,
    remote_parent: Option<RemoteParent>,
    tracestate: Option<Tracestate>,
    ended: bool,
}

impl Transaction {
    /// Creates a transaction with random identifiers.
    pub fn new(clock: TraceClock) -> Self {
        Self {
            id: format!("{:016x}", rand::random::<u64>()),
            trace_id: format!("{:032x}", rand::random::<u128>()),
            name: None,
            trace: trace::Trace::new(ROOT_SEGMENT_NAME, clock),
            sampling: SamplingState::default(),
            synthetics: None,
            remote_parent: None,
            tracestate: None,
            ended: false,
        }
    }

    /// Creates a transaction with the given identifiers.
    ///
    /// # Errors
    ///
    /// If either identifier is empty, an error is returned.
    pub fn with_ids<I, T>(id: I, trace_id: T, clock: TraceClock) -> Result<Self, TransactionError>
    where
        I: Into<String>,
        T: Into<String>,
    {
        let id = id.into();
        if id.is_empty() {
            return Err(TransactionError::MissingIdentity { field: "id" });
        }
        let trace_id = trace_id.into();
        if trace_id.is_empty() {
            return Err(TransactionError::MissingIdentity { field: "trace id" });
        }

        let mut transaction = Self::new(clock);
        transaction.id = id;
        transaction.trace_id = trace_id;
        Ok(transaction)
    }

    /// Returns the transaction identifier, also used as `guid`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the trace identifier.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Returns the transaction name, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Names the transaction.
    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        self.name = Some(name.into());
    }

    /// Returns the trace.
    pub fn trace(&self) -> &trace::Trace {
        &self.trace
    }

    /// Returns the trace, mutably.
    pub fn trace_mut(&mut self) -> &mut trace::Trace {
        &mut self.trace
    }

    /// Returns the sampling fields.
    pub fn sampling(&self) -> &SamplingState {
        &self.sampling
    }

    /// Returns the sampling priority, once decided.
    pub fn priority(&self) -> Option<f64> {
        self.sampling.priority
    }

    /// Returns whether the trace is kept, once decided.
    pub fn sampled(&self) -> Option<bool> {
        self.sampling.sampled
    }

    /// Returns the partial type, if partial granularity took part in the sampling decision.
    pub fn partial_type(&self) -> Option<PartialType> {
        self.sampling.partial_type
    }

    /// Returns the synthetics details, if this is a synthetic request.
    pub fn synthetics(&self) -> Option<&SyntheticsData> {
        self.synthetics.as_ref()
    }

    /// Marks the transaction as a synthetic request.
    pub fn set_synthetics(&mut self, synthetics: SyntheticsData) {
        self.synthetics = Some(synthetics);
    }

    /// Returns the upstream caller, if this transaction continues a remote trace.
    pub fn remote_parent(&self) -> Option<&RemoteParent> {
        self.remote_parent.as_ref()
    }

    /// Returns the inbound trace state, if any.
    pub fn tracestate(&self) -> Option<&Tracestate> {
        self.tracestate.as_ref()
    }

    /// Returns `true` once the transaction has ended.
    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    /// Returns the total time of the trace, as of now.
    pub fn total_time(&self) -> Duration {
        self.trace.total_time()
    }

    /// Returns a traceparent describing the remote parent, if its sampled flag is known.
    ///
    /// Only the trace identifier and the sampled flag matter for sampling decisions.
    pub(crate) fn remote_traceparent(&self) -> Option<Traceparent> {
        let parent = self.remote_parent.as_ref()?;
        let sampled = parent.sampled?;
        let parent_id = parent.span_id.clone().unwrap_or_default();
        Some(Traceparent::new(self.trace_id.clone(), parent_id, sampled))
    }

    pub(crate) fn continue_remote_trace(
        &mut self, trace_id: String, parent: RemoteParent, tracestate: Option<Tracestate>,
    ) {
        self.trace_id = trace_id;
        self.remote_parent = Some(parent);
        self.tracestate = tracestate;
    }

    /// Stops the root segment and freezes the intrinsics.
    pub(crate) fn finalize(&mut self, synthetics_enabled: bool) -> Result<(), TransactionError> {
        self.trace.end(SegmentId::ROOT).context(Trace)?;
        self.ended = true;

        let total_time = self.trace.total_time();
        let mut intrinsics = vec![
            ("totalTime", AttributeValue::from(total_time.as_secs_f64())),
            ("traceId", AttributeValue::from(self.trace_id.as_str())),
            ("guid", AttributeValue::from(self.id.as_str())),
        ];
        if let Some(priority) = self.sampling.priority {
            intrinsics.push(("priority", priority.into()));
        }
        if let Some(sampled) = self.sampling.sampled {
            intrinsics.push(("sampled", sampled.into()));
        }
        if let Some(partial_type) = self.sampling.partial_type {
            intrinsics.push(("partialType", partial_type.as_str().into()));
        }

        if let Some(parent) = &self.remote_parent {
            let fields = [
                ("parent.type", &parent.parent_type),
                ("parent.account", &parent.account_id),
                ("parent.app", &parent.application_id),
                ("parentId", &parent.transaction_id),
                ("parentSpanId", &parent.span_id),
            ];
            for (key, value) in fields {
                if let Some(value) = value {
                    intrinsics.push((key, value.as_str().into()));
                }
            }
        }

        match &self.synthetics {
            Some(synthetics) if synthetics_enabled => {
                intrinsics.push(("synthetics_resource_id", synthetics.resource_id.as_str().into()));
                intrinsics.push(("synthetics_job_id", synthetics.job_id.as_str().into()));
                intrinsics.push(("synthetics_monitor_id", synthetics.monitor_id.as_str().into()));
            }
            Some(_) => debug!(transaction_id = %self.id, "Synthetics disabled, not recording synthetics intrinsics."),
            None => {}
        }

        let frozen = self.trace.intrinsics_mut();
        for (key, value) in intrinsics {
            frozen.insert(key.to_string(), value);
        }
        Ok(())
    }
}

impl SamplingSubject for Transaction {
    fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn sampling_state(&self) -> &SamplingState {
        &self.sampling
    }

    fn sampling_state_mut(&mut self) -> &mut SamplingState {
        &mut self.sampling
    }
}

#[cfg(test)]
mod tests {
    use quanta::Clock;

    use super::*;

    #[test]
    fn random_identities() {
        let transaction = Transaction::new(TraceClock::default());
        assert_eq!(transaction.id().len(), 16);
        assert_eq!(transaction.trace_id().len(), 32);
        assert!(transaction.trace_id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(transaction.trace().root().name(), ROOT_SEGMENT_NAME);
        assert!(transaction.trace().root().timer().is_running());
        assert!(!transaction.sampling().is_decided());
        assert!(!transaction.is_ended());
    }

    #[test]
    fn identities_are_required() {
        assert_eq!(
            Transaction::with_ids("", "abc", TraceClock::default()).unwrap_err(),
            TransactionError::MissingIdentity { field: "id" }
        );
        assert_eq!(
            Transaction::with_ids("abc", "", TraceClock::default()).unwrap_err(),
            TransactionError::MissingIdentity { field: "trace id" }
        );

        let transaction = Transaction::with_ids("tx", "trace", TraceClock::default()).unwrap();
        assert_eq!(transaction.id(), "tx");
        assert_eq!(SamplingSubject::trace_id(&transaction), "trace");
    }

    #[test]
    fn finalize_freezes_intrinsics() {
        let (clock, mock) = Clock::mock();
        let mut transaction = Transaction::with_ids("tx", "trace", TraceClock::new(clock)).unwrap();
        transaction.set_synthetics(SyntheticsData {
            resource_id: "r".to_string(),
            job_id: "j".to_string(),
            monitor_id: "m".to_string(),
        });
        transaction.sampling_state_mut().priority = Some(3.0);
        transaction.sampling_state_mut().sampled = Some(true);
        transaction.continue_remote_trace(
            "trace".to_string(),
            RemoteParent {
                parent_type: Some("App".to_string()),
                span_id: Some("7d3efb1b173fecfa".to_string()),
                sampled: Some(true),
                ..Default::default()
            },
            None,
        );

        mock.increment(Duration::from_millis(1500));
        transaction.finalize(true).unwrap();

        let intrinsics = transaction.trace().intrinsics();
        assert!(transaction.is_ended());
        assert_eq!(intrinsics["totalTime"], AttributeValue::Float(1.5));
        assert_eq!(intrinsics["guid"], AttributeValue::from("tx"));
        assert_eq!(intrinsics["traceId"], AttributeValue::from("trace"));
        assert_eq!(intrinsics["priority"], AttributeValue::Float(3.0));
        assert_eq!(intrinsics["sampled"], AttributeValue::Bool(true));
        assert_eq!(intrinsics["parent.type"], AttributeValue::from("App"));
        assert_eq!(intrinsics["parentSpanId"], AttributeValue::from("7d3efb1b173fecfa"));
        assert!(!intrinsics.contains_key("parentId"));
        assert!(!intrinsics.contains_key("partialType"));
        assert_eq!(intrinsics["synthetics_monitor_id"], AttributeValue::from("m"));
    }

    #[test]
    fn synthetics_can_be_disabled() {
        let mut transaction = Transaction::new(TraceClock::default());
        transaction.set_synthetics(SyntheticsData::default());
        transaction.finalize(false).unwrap();
        assert!(!transaction.trace().intrinsics().contains_key("synthetics_job_id"));
    }

    #[test]
    fn remote_traceparent_needs_sampled_flag() {
        let mut transaction = Transaction::new(TraceClock::default());
        assert!(transaction.remote_traceparent().is_none());

        transaction.continue_remote_trace("abc".to_string(), RemoteParent::default(), None);
        assert!(transaction.remote_traceparent().is_none());

        transaction.continue_remote_trace(
            "abc".to_string(),
            RemoteParent {
                sampled: Some(false),
                ..Default::default()
            },
            None,
        );
        let traceparent = transaction.remote_traceparent().unwrap();
        assert_eq!(traceparent.trace_id(), "abc");
        assert!(!traceparent.is_sampled());
    }
}
