use async_trait::async_trait;
use tracing::info;

use super::{GatewayReceipt, OutboundSms, SmsGateway};
use crate::error::NotificationError;

/// Development gateway: logs the message instead of sending it.
#[derive(Debug, Default)]
pub struct LoggingGateway;

impl LoggingGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SmsGateway for LoggingGateway {
    async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError> {
        let provider_message_id = format!("log-{}", uuid::Uuid::new_v4());
        info!(
            to = %message.to,
            from = %message.from,
            correlation = %message.correlation_string,
            provider_message_id = %provider_message_id,
            body = %message.body,
            "SMS (logging gateway, not sent)"
        );
        Ok(GatewayReceipt {
            provider_message_id,
            status: Some("accepted".to_string()),
        })
    }

    fn name(&self) -> &str {
        "logging"
    }
}
