//! Hand-off of finished transactions to the harvester.

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::transaction::TransactionHandle;

/// Receives transactions once they have ended.
///
/// Submission happens on the thread that ended the transaction, so implementations should not block.
pub trait TransactionSink: Send + Sync {
    /// Accepts a finished transaction.
    fn submit(&self, transaction: TransactionHandle);
}

/// A sink that discards every transaction.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl TransactionSink for NoopSink {
    fn submit(&self, _transaction: TransactionHandle) {}
}

impl TransactionSink for UnboundedSender<TransactionHandle> {
    fn submit(&self, transaction: TransactionHandle) {
        if let Err(e) = self.send(transaction) {
            debug!(transaction_id = %e.0.id(), "Harvester is gone. Dropping finished transaction.");
        }
    }
}
