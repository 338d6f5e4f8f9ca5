//! The seam between the requestor and a messaging system.

pub mod loopback;

use async_trait::async_trait;

use crate::message::{OutboundMessage, SendReceipt};

pub use loopback::{LoopbackConfig, LoopbackTransport};

/// Errors a transport can report for a single send.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport is not connected or has been closed.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The broker rejected the message.
    #[error("send to `{destination}` rejected: {reason}")]
    Rejected { destination: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Told the message id a transport assigned, as soon as the message is sent.
///
/// Called before any reply to the message can be delivered, which lets a
/// provisional correlation key be rebound without racing the reply.
pub trait MessageSentCallback: Send + Sync {
    fn sent(&self, message_id: &str);
}

/// Sends requests. Replies come back out of band and are handed to
/// [`Requestor::on_reply`](crate::Requestor::on_reply).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `message`. If the transport assigns message ids it should report
    /// the id through `on_sent` before the message can be answered, and also
    /// return it in the receipt.
    async fn send(
        &self,
        message: OutboundMessage,
        on_sent: Option<&dyn MessageSentCallback>,
    ) -> Result<SendReceipt, TransportError>;
}
