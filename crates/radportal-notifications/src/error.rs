use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("Gateway failure: {0}")]
    GatewayFailure(String),

    #[error("Gateway timed out after {0} ms")]
    Timeout(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    /// Malformed input surfaced to the caller and never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            NotificationError::UnknownTemplate(_) | NotificationError::InvalidRecipient(_)
        )
    }

    /// Delivery failures the retry engine may resubmit.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotificationError::GatewayFailure(_) | NotificationError::Timeout(_)
        )
    }
}
