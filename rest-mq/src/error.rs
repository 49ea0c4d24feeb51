use thiserror::Error;

use crate::registry::AgentKey;

/// Failures surfaced to callers.
///
/// Conditions the bus handles in place with a log line (oversized fields,
/// body overflow, unknown config tokens, empty polls) never appear here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("requested queue limit {requested} exceeds the permitted maximum {limit}")]
    AgentLimitExceeded { requested: i64, limit: i64 },
    #[error("sender key {0} does not name a live agent")]
    UnknownSender(AgentKey),
    #[error("recipient key {0} does not name a live agent")]
    UnknownRecipient(AgentKey),
    #[error("message queue operation failed: {0}")]
    Transport(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
