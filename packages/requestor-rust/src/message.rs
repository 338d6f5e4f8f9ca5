//! Transport-neutral message envelopes.
//!
//! Bodies are opaque bytes; marshalling them is the caller's business.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

pub type Headers = BTreeMap<String, String>;

/// A request handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Overrides the configured reply timeout for this request only.
    pub timeout: Option<Duration>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            headers: Headers::new(),
            body: body.into(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A reply delivered by the transport, keyed by the correlation value it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyMessage {
    pub correlation_id: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl ReplyMessage {
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Acknowledgement that the transport physically sent a request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendReceipt {
    /// Identifier assigned by the broker, if it assigns one.
    pub message_id: Option<String>,
}

/// What the requestor knew about a request when it registered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub destination: String,
    /// Correlation id supplied by the caller, restored onto the reply.
    pub original_correlation_id: Option<String>,
    /// Key the request was registered under (provisional for message-id
    /// correlation).
    pub correlation_id: String,
    pub timeout: Duration,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        destination: impl Into<String>,
        correlation_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            destination: destination.into(),
            original_correlation_id: None,
            correlation_id: correlation_id.into(),
            timeout,
        }
    }
}
