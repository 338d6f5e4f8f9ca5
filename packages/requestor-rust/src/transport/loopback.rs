//! In-process transport that answers every request with an echo.
//!
//! Useful for demos and tests: replies are delivered on an unbounded channel
//! after a configurable delay, and the transport can be told to drop replies
//! or to fail sends outright.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{MessageSentCallback, Transport, TransportError};
use crate::config::DEFAULT_CORRELATION_HEADER;
use crate::message::{OutboundMessage, ReplyMessage, SendReceipt};

/// Header the loopback sets on replies to the id it assigned the request.
pub const MESSAGE_ID_HEADER: &str = "message-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Delay before the echo is delivered, in milliseconds.
    pub reply_delay_ms: u64,
    /// Drop the reply to every n-th request. Zero never drops.
    pub drop_every: u64,
    /// Header the echo reads its correlation id from.
    pub correlation_header: String,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            reply_delay_ms: 10,
            drop_every: 0,
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
        }
    }
}

pub struct LoopbackTransport {
    config: LoopbackConfig,
    replies: mpsc::UnboundedSender<ReplyMessage>,
    sent: AtomicU64,
    dropping: AtomicBool,
    failing: AtomicBool,
}

impl LoopbackTransport {
    /// Creates the transport and the receiving end its replies arrive on.
    #[must_use]
    pub fn new(config: LoopbackConfig) -> (Self, mpsc::UnboundedReceiver<ReplyMessage>) {
        let (replies, rx) = mpsc::unbounded_channel();
        let transport = Self {
            config,
            replies,
            sent: AtomicU64::new(0),
            dropping: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        };
        (transport, rx)
    }

    /// When set, requests are sent but never answered.
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::Relaxed);
    }

    /// When set, every send fails with [`TransportError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of requests accepted so far.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn should_drop(&self, sequence: u64) -> bool {
        self.dropping.load(Ordering::Relaxed)
            || (self.config.drop_every > 0 && sequence % self.config.drop_every == 0)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(
        &self,
        message: OutboundMessage,
        on_sent: Option<&dyn MessageSentCallback>,
    ) -> Result<SendReceipt, TransportError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(TransportError::Unavailable("loopback is failing sends".into()));
        }

        let sequence = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let message_id = format!("ID:{}", Uuid::new_v4());
        if let Some(callback) = on_sent {
            callback.sent(&message_id);
        }

        if self.should_drop(sequence) {
            debug!(%message_id, destination = %message.destination, "loopback dropping reply");
            return Ok(SendReceipt {
                message_id: Some(message_id),
            });
        }

        let correlation_id = message
            .header(&self.config.correlation_header)
            .map_or_else(|| message_id.clone(), str::to_owned);
        let mut reply = ReplyMessage::new(correlation_id, message.body.clone());
        reply.headers = message.headers;
        reply
            .headers
            .insert(MESSAGE_ID_HEADER.to_string(), message_id.clone());

        let delay = Duration::from_millis(self.config.reply_delay_ms);
        let replies = self.replies.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if replies.send(reply).is_err() {
                trace!("loopback reply receiver closed");
            }
        });

        Ok(SendReceipt {
            message_id: Some(message_id),
        })
    }
}
