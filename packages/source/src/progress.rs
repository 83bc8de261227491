//! Progress reporting for the day-by-day fetch loop.
//!
//! [`ProgressCallback`] keeps the pipeline independent of any rendering
//! backend. The CLI plugs in `indicatif` bars; library callers and tests
//! use [`NullProgress`].

use std::sync::Arc;

/// Receives progress updates from long-running sync operations.
///
/// Implementations must be `Send + Sync` so they can be shared through an
/// `Arc` with the orchestrator.
pub trait ProgressCallback: Send + Sync {
    /// Sets the total number of units (days) expected.
    fn set_total(&self, total: u64);

    /// Advances progress by `delta` units.
    fn inc(&self, delta: u64);

    /// Updates the message shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Marks progress as complete with a final message.
    fn finish(&self, msg: String);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
