use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;

use super::{GatewayReceipt, OutboundSms, SmsGateway};
use crate::config::GatewayConfig;
use crate::error::NotificationError;

type HmacSha256 = Hmac<Sha256>;

/// JSON-over-HTTP SMS provider.
///
/// Posts the [`OutboundSms`] payload to the configured endpoint and expects
/// `{providerMessageId, status}` back on 2xx.
pub struct HttpSmsGateway {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
    signing_secret: Option<String>,
    timeout_ms: u64,
}

impl HttpSmsGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, NotificationError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| NotificationError::InvalidConfig("Missing gateway.endpoint".into()))?;

        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
            api_key: config.api_key.clone(),
            signing_secret: config.signing_secret.clone(),
            timeout_ms: config.timeout_ms,
        })
    }

    fn sign_payload(&self, payload: &str, secret: &str) -> Result<String, NotificationError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotificationError::Internal(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, message: &OutboundSms) -> Result<GatewayReceipt, NotificationError> {
        let payload_str = serde_json::to_string(message)
            .map_err(|e| NotificationError::Internal(e.to_string()))?;

        let mut request = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Idempotency-Key", &message.correlation_string);

        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        if let Some(secret) = &self.signing_secret {
            let signature = self.sign_payload(&payload_str, secret)?;
            request = request.header("X-Signature-256", format!("sha256={}", signature));
        }

        let response = request.body(payload_str).send().await.map_err(|e| {
            if e.is_timeout() {
                NotificationError::Timeout(self.timeout_ms)
            } else {
                NotificationError::GatewayFailure(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(NotificationError::GatewayFailure(format!(
                "provider returned {}: {}",
                status.as_u16(),
                error
            )));
        }

        response
            .json::<GatewayReceipt>()
            .await
            .map_err(|e| NotificationError::GatewayFailure(format!("invalid provider response: {e}")))
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> OutboundSms {
        OutboundSms {
            to: "+61412345678".into(),
            body: "Your report is ready".into(),
            from: "RadPortal".into(),
            status_callback_url: Some("https://portal.example.com/webhooks/sms/status".into()),
            correlation_string: "n1-0".into(),
        }
    }

    fn gateway(server: &MockServer, timeout_ms: u64) -> HttpSmsGateway {
        HttpSmsGateway::new(&GatewayConfig {
            endpoint: Some(format!("{}/messages", server.uri())),
            api_key: Some("key".into()),
            signing_secret: Some("secret123".into()),
            timeout_ms,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("Idempotency-Key", "n1-0"))
            .and(header("Authorization", "Bearer key"))
            .and(header_exists("X-Signature-256"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "providerMessageId": "SM123",
                "status": "queued"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = gateway(&server, 2_000).send(&message()).await.unwrap();
        assert_eq!(receipt.provider_message_id, "SM123");
        assert_eq!(receipt.status.as_deref(), Some("queued"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_gateway_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let err = gateway(&server, 2_000).send(&message()).await.unwrap_err();
        assert!(matches!(err, NotificationError::GatewayFailure(ref m) if m.contains("503")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(serde_json::json!({"providerMessageId": "late"})),
            )
            .mount(&server)
            .await;

        let err = gateway(&server, 50).send(&message()).await.unwrap_err();
        assert!(matches!(err, NotificationError::Timeout(50)));
    }

    #[test]
    fn test_payload_signature_is_stable() {
        let gw = HttpSmsGateway::new(&GatewayConfig {
            endpoint: Some("http://localhost".into()),
            ..Default::default()
        })
        .unwrap();
        let first = gw.sign_payload(r#"{"to":"+61412345678"}"#, "secret123").unwrap();
        let second = gw.sign_payload(r#"{"to":"+61412345678"}"#, "secret123").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let value = serde_json::to_value(message()).unwrap();
        assert_eq!(value["correlationString"], "n1-0");
        assert!(value.get("statusCallbackUrl").is_some());
    }
}
