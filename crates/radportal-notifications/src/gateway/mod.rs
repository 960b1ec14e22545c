pub mod http;
pub mod logging;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::NotificationError;

/// Provider-agnostic outbound SMS payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSms {
    /// E.164 destination
    pub to: String,
    pub body: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_callback_url: Option<String>,
    /// Per-request token for provider idempotency
    pub correlation_string: String,
}

/// Provider acknowledgement of an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayReceipt {
    pub provider_message_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Pluggable SMS provider
#[async_trait]
pub trait SmsGateway: Send + Sync {
    /// Submit one message. Any error means the provider did not accept it.
    async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError>;

    fn name(&self) -> &str;
}

pub use http::HttpSmsGateway;
pub use logging::LoggingGateway;
