//! Hook points for reporting correlation events to an external sink.

use crate::message::RequestContext;

/// Receives correlation events. Every method defaults to a no-op.
///
/// Called on the thread that caused the event and never while a table lock
/// is held. `on_timeout` runs from the purge task while the expired entry is
/// still in the map (it is removed right after the listener approves); the
/// other events fire once the map has been updated. Implementations should
/// be quick.
pub trait CorrelationObserver: Send + Sync {
    fn on_registered(&self, _key: &str, _context: &RequestContext) {}

    fn on_rebound(&self, _provisional_key: &str, _final_key: &str) {}

    fn on_resolved(&self, _key: &str, _context: &RequestContext) {}

    fn on_failed(&self, _key: &str, _context: &RequestContext) {}

    fn on_timeout(&self, _key: &str, _context: &RequestContext) {}

    /// A reply arrived for a key with no pending entry.
    fn on_stale_reply(&self, _key: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl CorrelationObserver for NoopObserver {}
