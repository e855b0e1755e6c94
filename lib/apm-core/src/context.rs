//! Tracking of the segment currently in progress.

use std::sync::{Arc, Mutex, PoisonError};

use crate::transaction::{SegmentHandle, TransactionHandle};

/// Tracks which segment is currently in progress.
///
/// New segments are created as children of the current segment, and the current segment's transaction is the
/// current transaction.
pub trait ContextManager: Send + Sync {
    /// Returns the current segment, if any.
    fn current_segment(&self) -> Option<SegmentHandle>;

    /// Makes `segment` the current segment, returning the previous one.
    fn set_current_segment(&self, segment: Option<SegmentHandle>) -> Option<SegmentHandle>;

    /// Returns the transaction of the current segment, if any.
    fn current_transaction(&self) -> Option<TransactionHandle> {
        self.current_segment().map(|segment| segment.transaction().clone())
    }
}

/// A context manager holding a single current segment shared by every caller.
#[derive(Clone, Debug, Default)]
pub struct SharedContextManager {
    current: Arc<Mutex<Option<SegmentHandle>>>,
}

impl SharedContextManager {
    /// Creates an empty context manager.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContextManager for SharedContextManager {
    fn current_segment(&self) -> Option<SegmentHandle> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_current_segment(&self, segment: Option<SegmentHandle>) -> Option<SegmentHandle> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, segment)
    }
}

struct RestoreGuard<'a, M: ContextManager + ?Sized> {
    manager: &'a M,
    previous: Option<Option<SegmentHandle>>,
}

impl<M: ContextManager + ?Sized> Drop for RestoreGuard<'_, M> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.manager.set_current_segment(previous);
        }
    }
}

/// Runs `f` with `segment` as the current segment, then restores whichever segment was current before.
///
/// The previous segment is restored even if `f` panics.
pub fn run_in_context<M, F, R>(manager: &M, segment: Option<SegmentHandle>, f: F) -> R
where
    M: ContextManager + ?Sized,
    F: FnOnce() -> R,
{
    let previous = manager.set_current_segment(segment);
    let _guard = RestoreGuard {
        manager,
        previous: Some(previous),
    };
    f()
}

/// Wraps `f` so that every call runs with `segment` as the current segment.
///
/// Useful for callbacks that run after the segment that registered them is no longer current.
pub fn bind_to_context<F, R>(
    manager: Arc<dyn ContextManager>, segment: Option<SegmentHandle>, f: F,
) -> impl Fn() -> R + Send + Sync
where
    F: Fn() -> R + Send + Sync,
{
    move || run_in_context(manager.as_ref(), segment.clone(), &f)
}
