//! The message-producing side of request/reply.
//!
//! A [`Requestor`] registers each request with the [`CorrelationManager`]
//! before handing it to the [`Transport`], so a reply can never arrive ahead
//! of its pending entry. Replies come back through [`Requestor::on_reply`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::correlation::{
    Continuation, CorrelationError, CorrelationManager, CorrelationPlan, PendingReply,
};
use crate::message::{OutboundMessage, ReplyMessage, RequestContext};
use crate::transport::{MessageSentCallback, Transport};

/// Rebinds a provisional key the moment the transport reports the message id.
struct RebindOnSent<'a> {
    manager: &'a CorrelationManager,
    provisional_key: &'a str,
    reported: AtomicBool,
    /// Key the entry lives under after a successful rebind.
    rebound: OnceLock<String>,
}

impl RebindOnSent<'_> {
    fn current_key(&self) -> &str {
        self.rebound.get().map_or(self.provisional_key, String::as_str)
    }
}

impl MessageSentCallback for RebindOnSent<'_> {
    fn sent(&self, message_id: &str) {
        if !self.reported.swap(true, Ordering::AcqRel)
            && self.manager.rebind(self.provisional_key, message_id)
        {
            let _ = self.rebound.set(message_id.to_owned());
        }
    }
}

pub struct Requestor {
    manager: Arc<CorrelationManager>,
    transport: Arc<dyn Transport>,
}

impl Requestor {
    #[must_use]
    pub fn new(manager: Arc<CorrelationManager>, transport: Arc<dyn Transport>) -> Self {
        Self { manager, transport }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<CorrelationManager> {
        &self.manager
    }

    /// Sends `message` and returns a handle that resolves with the reply.
    ///
    /// Send failures and timeouts are delivered through the handle.
    ///
    /// # Errors
    ///
    /// Returns an error only if the request could not be registered (the
    /// manager is not running, or the correlation id is already pending).
    pub async fn request(&self, mut message: OutboundMessage) -> Result<PendingReply, CorrelationError> {
        let (plan, context) = self.prepare(&mut message);
        let (continuation, pending) = PendingReply::channel(plan.key.clone());
        self.manager
            .register_pending(plan.key.clone(), context.clone(), continuation, context.timeout)?;
        self.dispatch(&plan, message).await;
        Ok(pending)
    }

    /// Sends `message`, invoking `continuation` exactly once when the request
    /// resolves. Returns the key the request was registered under.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request); the continuation is dropped
    /// uninvoked in that case.
    pub async fn request_with(
        &self,
        mut message: OutboundMessage,
        continuation: Continuation,
    ) -> Result<String, CorrelationError> {
        let (plan, context) = self.prepare(&mut message);
        let timeout = context.timeout;
        self.manager
            .register_pending(plan.key.clone(), context, continuation, timeout)?;
        self.dispatch(&plan, message).await;
        Ok(plan.key)
    }

    /// Routes an inbound reply to its pending request. Returns `false` for
    /// stale replies.
    pub fn on_reply(&self, reply: ReplyMessage) -> bool {
        let key = reply.correlation_id.clone();
        self.manager.resolve_reply(&key, reply)
    }

    /// Feeds every reply from `replies` into [`on_reply`](Self::on_reply)
    /// until the channel closes.
    pub fn spawn_reply_listener(
        self: &Arc<Self>,
        mut replies: mpsc::UnboundedReceiver<ReplyMessage>,
    ) -> JoinHandle<()> {
        let requestor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                requestor.on_reply(reply);
            }
            debug!("reply channel closed");
        })
    }

    fn prepare(&self, message: &mut OutboundMessage) -> (CorrelationPlan, RequestContext) {
        let plan = self.manager.plan_correlation(message);
        let timeout: Duration = message
            .timeout
            .unwrap_or_else(|| self.manager.config().default_request_timeout());

        let mut context = RequestContext::new(message.destination.clone(), plan.key.clone(), timeout);
        context.original_correlation_id.clone_from(&plan.original_correlation_id);
        (plan, context)
    }

    async fn dispatch(&self, plan: &CorrelationPlan, message: OutboundMessage) {
        let destination = message.destination.clone();
        let rebinder = plan.needs_rebind.then(|| RebindOnSent {
            manager: &self.manager,
            provisional_key: &plan.key,
            reported: AtomicBool::new(false),
            rebound: OnceLock::new(),
        });
        let on_sent = rebinder.as_ref().map(|r| r as &dyn MessageSentCallback);

        debug!(correlation_id = %plan.key, %destination, "sending request");
        match self.transport.send(message, on_sent).await {
            Ok(receipt) => {
                let Some(rebinder) = &rebinder else { return };
                if rebinder.reported.load(Ordering::Acquire) {
                    return;
                }
                match receipt.message_id {
                    Some(message_id) => rebinder.sent(&message_id),
                    None => {
                        self.manager.fail(
                            &plan.key,
                            CorrelationError::Rebind {
                                message: format!("transport assigned no message id for `{destination}`"),
                            },
                        );
                    }
                }
            }
            Err(err) => {
                let key = rebinder.as_ref().map_or(plan.key.as_str(), RebindOnSent::current_key);
                warn!(correlation_id = %key, %destination, error = %err, "send failed");
                self.manager.fail(
                    key,
                    CorrelationError::Send {
                        message: err.to_string(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use replywire_core::Lifecycle;

    use super::*;
    use crate::config::{CorrelationConfig, CorrelationStrategy};
    use crate::message::SendReceipt;
    use crate::transport::TransportError;

    /// Records sends; never replies on its own.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Mutex<Vec<OutboundMessage>>,
        message_id: Option<String>,
        report_on_sent: bool,
        fail: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            message: OutboundMessage,
            on_sent: Option<&dyn MessageSentCallback>,
        ) -> Result<SendReceipt, TransportError> {
            if let (true, Some(callback), Some(id)) = (self.report_on_sent, on_sent, &self.message_id) {
                callback.sent(id);
            }
            if self.fail {
                return Err(TransportError::Rejected {
                    destination: message.destination,
                    reason: "queue full".into(),
                });
            }
            self.sent.lock().push(message);
            Ok(SendReceipt {
                message_id: self.message_id.clone(),
            })
        }
    }

    async fn requestor(
        strategy: CorrelationStrategy,
        transport: ScriptedTransport,
    ) -> (Requestor, Arc<ScriptedTransport>) {
        let manager = Arc::new(CorrelationManager::new(CorrelationConfig {
            strategy,
            ..CorrelationConfig::default()
        }));
        manager.start().await.unwrap();
        let transport = Arc::new(transport);
        (Requestor::new(manager, transport.clone()), transport)
    }

    #[tokio::test]
    async fn generated_correlation_id_travels_with_request() {
        let (requestor, transport) =
            requestor(CorrelationStrategy::CorrelationId, ScriptedTransport::default()).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap();
        let sent = transport.sent.lock()[0].clone();
        assert_eq!(sent.header("correlation-id"), Some(pending.correlation_id()));

        assert!(requestor.on_reply(ReplyMessage::new(pending.correlation_id(), "pong")));
        assert_eq!(pending.wait().await.unwrap().body, "pong");
    }

    #[tokio::test]
    async fn message_id_strategy_rebinds_from_callback() {
        let transport = ScriptedTransport {
            message_id: Some("M42".into()),
            report_on_sent: true,
            ..ScriptedTransport::default()
        };
        let (requestor, _) = requestor(CorrelationStrategy::MessageId, transport).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap();
        let manager = requestor.manager();
        assert!(!manager.is_pending(pending.correlation_id()));
        assert!(manager.is_pending("M42"));

        assert!(requestor.on_reply(ReplyMessage::new("M42", "pong")));
        assert_eq!(pending.wait().await.unwrap().body, "pong");
    }

    #[tokio::test]
    async fn message_id_strategy_falls_back_to_receipt() {
        let transport = ScriptedTransport {
            message_id: Some("M7".into()),
            ..ScriptedTransport::default()
        };
        let (requestor, _) = requestor(CorrelationStrategy::MessageId, transport).await;

        let key = requestor
            .request_with(OutboundMessage::new("queue:orders", "ping"), Box::new(|_| {}))
            .await
            .unwrap();
        assert!(!requestor.manager().is_pending(&key));
        assert!(requestor.manager().is_pending("M7"));
    }

    #[tokio::test]
    async fn missing_message_id_fails_request() {
        let (requestor, _) =
            requestor(CorrelationStrategy::MessageId, ScriptedTransport::default()).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap();
        assert!(matches!(
            pending.wait().await,
            Err(CorrelationError::Rebind { .. })
        ));
        assert_eq!(requestor.manager().pending_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_is_delivered_to_caller() {
        let transport = ScriptedTransport {
            fail: true,
            ..ScriptedTransport::default()
        };
        let (requestor, _) = requestor(CorrelationStrategy::CorrelationId, transport).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap();
        let err = pending.wait().await.unwrap_err();
        assert_eq!(
            err,
            CorrelationError::Send {
                message: "send to `queue:orders` rejected: queue full".into()
            }
        );
        assert_eq!(requestor.manager().pending_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_after_message_id_report_fails_rebound_entry() {
        let transport = ScriptedTransport {
            message_id: Some("M9".into()),
            report_on_sent: true,
            fail: true,
            ..ScriptedTransport::default()
        };
        let (requestor, _) = requestor(CorrelationStrategy::MessageId, transport).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap();
        assert!(matches!(
            pending.wait().await,
            Err(CorrelationError::Send { .. })
        ));
        assert!(!requestor.manager().is_pending("M9"));
        assert_eq!(requestor.manager().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_timeout_overrides_default() {
        let (requestor, _) =
            requestor(CorrelationStrategy::CorrelationId, ScriptedTransport::default()).await;

        let pending = requestor
            .request(OutboundMessage::new("queue:orders", "ping").with_timeout(Duration::from_millis(100)))
            .await
            .unwrap();
        let resolution = pending.resolution().await.unwrap();
        assert_eq!(resolution.context.timeout, Duration::from_millis(100));
        assert!(resolution.outcome.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn request_before_start_is_rejected() {
        let manager = Arc::new(CorrelationManager::new(CorrelationConfig::default()));
        let transport = Arc::new(ScriptedTransport::default());
        let requestor = Requestor::new(manager, transport.clone());

        let err = requestor
            .request(OutboundMessage::new("queue:orders", "ping"))
            .await
            .unwrap_err();
        assert_eq!(err, CorrelationError::NotRunning);
        assert!(transport.sent.lock().is_empty());
    }
}
