//! The correlation manager: pending requests keyed by correlation id.
//!
//! Built on an [`ExpiringMap`] whose eviction listener turns an expired entry
//! into a timeout failure for the waiting caller. Every resolution path
//! (reply, failure, timeout) removes the entry and takes its continuation out
//! of a take-once slot, so exactly one of them wins for a given request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use replywire_core::{
    deadline_after, EvictionListener, ExpiringMap, ManagedService, ServiceController,
};

use super::entry::{Continuation, CorrelationEntry, PendingReply};
use super::error::CorrelationError;
use super::key::{self, CorrelationPlan};
use crate::config::CorrelationConfig;
use crate::message::{OutboundMessage, ReplyMessage, RequestContext};
use crate::observer::{CorrelationObserver, NoopObserver};

// ---------------------------------------------------------------------------
// Timeout notification
// ---------------------------------------------------------------------------

/// Eviction listener that fails each expired request with a timeout.
struct TimeoutNotifier {
    manager: String,
    observer: Arc<dyn CorrelationObserver>,
}

impl EvictionListener<String, CorrelationEntry> for TimeoutNotifier {
    fn on_eviction(&self, key: &String, entry: &CorrelationEntry) -> anyhow::Result<bool> {
        let context = entry.context();
        let error = CorrelationError::Timeout {
            correlation_id: key.clone(),
            timeout: context.timeout,
        };

        // Already resolved entries (e.g. a reply won the race) are just dropped.
        if entry.complete(Err(error)) {
            warn!(
                manager = %self.manager,
                correlation_id = %key,
                destination = %context.destination,
                timeout = ?context.timeout,
                "no reply received in time"
            );
            metrics::counter!("replywire_correlation_timeouts_total", "manager" => self.manager.clone())
                .increment(1);
            self.observer.on_timeout(key, context);
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// CorrelationManager
// ---------------------------------------------------------------------------

/// Registry of outstanding requests awaiting an asynchronous reply.
///
/// A composite service: its pending map (and the map's purge task) is a child
/// that starts before the manager and stops after it. Stopping abandons all
/// outstanding requests without invoking their continuations.
pub struct CorrelationManager {
    config: CorrelationConfig,
    pending: Arc<ExpiringMap<String, CorrelationEntry>>,
    observer: Arc<dyn CorrelationObserver>,
    controller: ServiceController,
}

impl CorrelationManager {
    #[must_use]
    pub fn new(config: CorrelationConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    #[must_use]
    pub fn with_observer(config: CorrelationConfig, observer: Arc<dyn CorrelationObserver>) -> Self {
        let notifier = Arc::new(TimeoutNotifier {
            manager: config.name.clone(),
            observer: Arc::clone(&observer),
        });
        let pending = Arc::new(ExpiringMap::with_listener(
            format!("{}-pending", config.name),
            config.purge_interval(),
            notifier,
        ));

        let controller = ServiceController::new(config.name.clone());
        controller.add_child(pending.clone());

        Self {
            config,
            pending,
            observer,
            controller,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Chooses the correlation key for `message`; see [`key::plan_correlation`].
    pub fn plan_correlation(&self, message: &mut OutboundMessage) -> CorrelationPlan {
        key::plan_correlation(&self.config, message)
    }

    /// Registers a pending request under `key`. Must happen before the request
    /// is sent so a fast reply always finds its entry.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::NotRunning`] unless the manager is started,
    /// and [`CorrelationError::DuplicateKey`] if `key` is already pending. The
    /// continuation is dropped uninvoked in both cases.
    pub fn register_pending(
        &self,
        key: impl Into<String>,
        context: RequestContext,
        continuation: Continuation,
        timeout: Duration,
    ) -> Result<(), CorrelationError> {
        let key = key.into();
        if !self.controller.is_run_allowed() {
            return Err(CorrelationError::NotRunning);
        }

        let entry = CorrelationEntry::new(context, key.clone(), deadline_after(Instant::now(), timeout), continuation);
        if self
            .pending
            .put_if_absent(key.clone(), entry.clone(), timeout)
            .is_some()
        {
            return Err(CorrelationError::DuplicateKey(key));
        }

        debug!(
            manager = %self.config.name,
            correlation_id = %key,
            timeout = ?timeout,
            "registered pending request"
        );
        metrics::counter!("replywire_correlation_registered_total", "manager" => self.config.name.clone())
            .increment(1);
        self.observer.on_registered(&key, entry.context());
        Ok(())
    }

    /// Registers a pending request whose resolution is delivered to the
    /// returned handle.
    ///
    /// # Errors
    ///
    /// Same as [`register_pending`](Self::register_pending).
    pub fn register_awaitable(
        &self,
        key: impl Into<String>,
        context: RequestContext,
        timeout: Duration,
    ) -> Result<PendingReply, CorrelationError> {
        let key = key.into();
        let (continuation, pending) = PendingReply::channel(key.clone());
        self.register_pending(key, context, continuation, timeout)?;
        Ok(pending)
    }

    /// Moves a pending request from its provisional key to the key the
    /// transport assigned. The remaining timeout budget carries over.
    ///
    /// Returns `false` (and does nothing) if the provisional key has already
    /// resolved. If another request already owns `final_key`, this request is
    /// failed with [`CorrelationError::Rebind`].
    pub fn rebind(&self, provisional_key: &str, final_key: impl Into<String>) -> bool {
        let final_key = final_key.into();
        let Some(entry) = self.pending.peek(provisional_key) else {
            debug!(
                manager = %self.config.name,
                provisional_key,
                %final_key,
                "rebind skipped; request already resolved"
            );
            return false;
        };
        if provisional_key == final_key {
            return true;
        }

        // Insert under the final key before dropping the provisional one, so a
        // reply carrying the final key can never miss the entry.
        let remaining = entry.remaining(Instant::now());
        if self
            .pending
            .put_if_absent(final_key.clone(), entry.clone(), remaining)
            .is_some()
        {
            if self.pending.remove(provisional_key).is_some() {
                let error = CorrelationError::Rebind {
                    message: format!("correlation id `{final_key}` is already pending"),
                };
                self.complete_failure(provisional_key, &entry, error);
            }
            return false;
        }
        entry.set_final_key(final_key.clone());

        if self.pending.remove(provisional_key).is_none() {
            // Resolved under the provisional key while it was being moved.
            self.pending.remove(&final_key);
            return false;
        }

        debug!(
            manager = %self.config.name,
            provisional_key,
            %final_key,
            remaining = ?remaining,
            "rebound pending request"
        );
        self.observer.on_rebound(provisional_key, &final_key);
        true
    }

    /// Completes the request pending under `key` with `reply`.
    ///
    /// Returns `false` if nothing is pending under `key` (already resolved,
    /// timed out, or never registered); the reply is logged and discarded.
    pub fn resolve_reply(&self, key: &str, mut reply: ReplyMessage) -> bool {
        let Some(entry) = self.pending.remove(key) else {
            self.discard_stale(key);
            return false;
        };

        if let Some(original) = &entry.context().original_correlation_id {
            reply
                .headers
                .insert(self.config.correlation_header.clone(), original.clone());
        }

        if !entry.complete(Ok(reply)) {
            self.discard_stale(key);
            return false;
        }

        debug!(manager = %self.config.name, correlation_id = key, "resolved pending request");
        metrics::counter!("replywire_correlation_resolved_total", "manager" => self.config.name.clone())
            .increment(1);
        self.observer.on_resolved(key, entry.context());
        true
    }

    /// Completes the request pending under `key` with `error`.
    pub fn fail(&self, key: &str, error: CorrelationError) -> bool {
        match self.pending.remove(key) {
            Some(entry) => self.complete_failure(key, &entry, error),
            None => false,
        }
    }

    fn complete_failure(&self, key: &str, entry: &CorrelationEntry, error: CorrelationError) -> bool {
        let reason = error.to_string();
        if !entry.complete(Err(error)) {
            return false;
        }
        warn!(manager = %self.config.name, correlation_id = key, %reason, "pending request failed");
        metrics::counter!("replywire_correlation_failed_total", "manager" => self.config.name.clone())
            .increment(1);
        self.observer.on_failed(key, entry.context());
        true
    }

    fn discard_stale(&self, key: &str) {
        debug!(manager = %self.config.name, correlation_id = key, "discarding reply with no pending request");
        metrics::counter!("replywire_correlation_stale_replies_total", "manager" => self.config.name.clone())
            .increment(1);
        self.observer.on_stale_reply(key);
    }

    /// Whether a request is pending under `key`. Does not extend its timeout.
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn pending_keys(&self) -> Vec<String> {
        self.pending.keys()
    }

    /// Runs one purge cycle now instead of waiting for the purge task.
    pub fn purge_expired(&self) -> usize {
        self.pending.purge()
    }
}

#[async_trait]
impl ManagedService for CorrelationManager {
    fn controller(&self) -> &ServiceController {
        &self.controller
    }

    async fn do_start(&self) -> anyhow::Result<()> {
        info!(
            manager = %self.config.name,
            strategy = ?self.config.strategy,
            purge_interval = ?self.config.purge_interval(),
            "correlation manager ready"
        );
        Ok(())
    }

    async fn do_stop(&self) -> anyhow::Result<()> {
        let abandoned = self.pending.len();
        if abandoned > 0 {
            warn!(manager = %self.config.name, abandoned, "abandoning pending requests");
        }
        Ok(())
    }

    fn supports_suspension(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
