//! Request/reply correlation: keys, pending entries, and the manager that
//! owns them.

pub mod entry;
pub mod error;
pub mod key;
pub mod manager;

pub use entry::{Continuation, CorrelationEntry, PendingReply, Resolution};
pub use error::CorrelationError;
pub use key::{
    generate_correlation_id, is_generated, plan_correlation, CorrelationPlan,
    GENERATED_CORRELATION_ID_PREFIX,
};
pub use manager::CorrelationManager;
