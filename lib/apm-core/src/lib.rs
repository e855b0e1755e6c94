//! Transaction tracing and adaptive sampling for the APM agent.
//!
//! A [`Tracer`] starts [`TransactionHandle`]s, each owning a tree of timed segments. When a transaction ends, the
//! [`Samplers`] decide whether its trace is kept, taking into account any trace context received from an upstream
//! service, and the transaction is handed off to a [`TransactionSink`].
#![deny(warnings)]
#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod distributed;
pub mod harvest;
pub mod interval;
pub mod samplers;
pub mod segment;
pub mod timer;
pub mod trace;
pub mod tracer;
pub mod transaction;

pub use self::config::TracingConfiguration;
pub use self::harvest::TransactionSink;
pub use self::samplers::Samplers;
pub use self::tracer::{ConnectResponse, Tracer, TracerBuilder};
pub use self::transaction::{SegmentHandle, Transaction, TransactionHandle};
