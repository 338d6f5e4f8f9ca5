use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error::CorrelationError;
use crate::message::{ReplyMessage, RequestContext};

/// Single-use callback invoked when a pending request resolves.
pub type Continuation = Box<dyn FnOnce(Resolution) + Send + 'static>;

/// What a continuation receives: the original request context and either the
/// reply or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub context: RequestContext,
    pub outcome: Result<ReplyMessage, CorrelationError>,
}

impl Resolution {
    /// Discards the context.
    ///
    /// # Errors
    ///
    /// Returns the failure the request resolved with.
    pub fn into_reply(self) -> Result<ReplyMessage, CorrelationError> {
        self.outcome
    }
}

/// A pending request stored in the correlation map.
///
/// Clones share state, so the entry can be rebound under a new key while the
/// purge scan holds a snapshot of it. The continuation slot is take-once:
/// whichever path completes first owns the resolution.
#[derive(Clone)]
pub struct CorrelationEntry {
    inner: Arc<EntryInner>,
}

struct EntryInner {
    context: RequestContext,
    provisional_key: String,
    final_key: OnceLock<String>,
    deadline: Instant,
    continuation: Mutex<Option<Continuation>>,
}

impl fmt::Debug for CorrelationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationEntry")
            .field("context", &self.inner.context)
            .field("provisional_key", &self.inner.provisional_key)
            .field("final_key", &self.inner.final_key.get())
            .field("resolved", &self.is_resolved())
            .finish_non_exhaustive()
    }
}

impl CorrelationEntry {
    pub(crate) fn new(
        context: RequestContext,
        provisional_key: String,
        deadline: Instant,
        continuation: Continuation,
    ) -> Self {
        Self {
            inner: Arc::new(EntryInner {
                context,
                provisional_key,
                final_key: OnceLock::new(),
                deadline,
                continuation: Mutex::new(Some(continuation)),
            }),
        }
    }

    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.inner.context
    }

    #[must_use]
    pub fn provisional_key(&self) -> &str {
        &self.inner.provisional_key
    }

    /// The broker-assigned key, once the entry has been rebound.
    #[must_use]
    pub fn final_key(&self) -> Option<&str> {
        self.inner.final_key.get().map(String::as_str)
    }

    /// Returns `false` if a final key was already recorded.
    pub(crate) fn set_final_key(&self, key: String) -> bool {
        self.inner.final_key.set(key).is_ok()
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// Time left before the original timeout budget runs out.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.inner.deadline.saturating_duration_since(now)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.continuation.lock().is_none()
    }

    /// Invokes the continuation if nobody has yet. Returns whether this call
    /// did the resolving. The slot lock is released before the callback runs.
    pub(crate) fn complete(&self, outcome: Result<ReplyMessage, CorrelationError>) -> bool {
        let continuation = self.inner.continuation.lock().take();
        match continuation {
            Some(continuation) => {
                continuation(Resolution {
                    context: self.inner.context.clone(),
                    outcome,
                });
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// PendingReply
// ---------------------------------------------------------------------------

/// Handle for awaiting a request registered with a channel continuation.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingReply {
    /// Builds a continuation that forwards into the returned handle.
    pub(crate) fn channel(correlation_id: String) -> (Continuation, Self) {
        let (tx, rx) = oneshot::channel();
        let continuation: Continuation = Box::new(move |resolution| {
            // The caller may have stopped waiting.
            let _ = tx.send(resolution);
        });
        (continuation, Self { correlation_id, rx })
    }

    /// The key the request was registered under.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Waits for the request to resolve.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Abandoned`] if the entry was dropped
    /// without resolving (the manager was stopped).
    pub async fn resolution(self) -> Result<Resolution, CorrelationError> {
        self.rx.await.map_err(|_| CorrelationError::Abandoned)
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns the failure the request resolved with, or
    /// [`CorrelationError::Abandoned`].
    pub async fn wait(self) -> Result<ReplyMessage, CorrelationError> {
        self.resolution().await?.into_reply()
    }
}
