//! Choosing the correlation key for an outbound request.
//!
//! Precedence:
//! 1. An explicit correlation id in the request headers, unless it carries the
//!    generated prefix (a previous hop made it up, so it is treated as absent).
//! 2. With [`CorrelationStrategy::MessageId`], a provisional key that is later
//!    rebound to the broker-assigned message id.
//! 3. Otherwise a fresh prefixed id, written into the request headers so the
//!    remote side's reply carries it back.

use uuid::Uuid;

use crate::config::{CorrelationConfig, CorrelationStrategy};
use crate::message::OutboundMessage;

/// Prefix marking correlation ids generated by this library.
pub const GENERATED_CORRELATION_ID_PREFIX: &str = "Replywire-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationPlan {
    /// Key to register the pending request under.
    pub key: String,
    /// Caller-supplied id, if it was honoured.
    pub original_correlation_id: Option<String>,
    /// The key is provisional and must be rebound after the send.
    pub needs_rebind: bool,
}

#[must_use]
pub fn is_generated(correlation_id: &str) -> bool {
    correlation_id.starts_with(GENERATED_CORRELATION_ID_PREFIX)
}

#[must_use]
pub fn generate_correlation_id() -> String {
    format!("{GENERATED_CORRELATION_ID_PREFIX}{}", Uuid::new_v4())
}

/// Picks the key for `message`, rewriting its correlation header as needed.
pub fn plan_correlation(config: &CorrelationConfig, message: &mut OutboundMessage) -> CorrelationPlan {
    let header = config.correlation_header.as_str();

    let explicit = message
        .header(header)
        .filter(|id| !id.is_empty() && !is_generated(id))
        .map(str::to_owned);

    if let Some(id) = explicit {
        return CorrelationPlan {
            key: id.clone(),
            original_correlation_id: Some(id),
            needs_rebind: false,
        };
    }

    match config.strategy {
        CorrelationStrategy::MessageId => {
            // A stale generated id would only confuse the remote side.
            message.headers.remove(header);
            CorrelationPlan {
                key: Uuid::new_v4().to_string(),
                original_correlation_id: None,
                needs_rebind: true,
            }
        }
        CorrelationStrategy::CorrelationId => {
            let id = generate_correlation_id();
            message.headers.insert(header.to_owned(), id.clone());
            CorrelationPlan {
                key: id,
                original_correlation_id: None,
                needs_rebind: false,
            }
        }
    }
}
