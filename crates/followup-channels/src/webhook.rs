//! HTTP webhook delivery: POSTs the message as JSON to an SMS bridge
//! (an n8n flow or similar) that owns the actual carrier integration.

use std::time::Duration;

use async_trait::async_trait;
use followup_core::config::DeliveryConfig;
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::{DeliveryChannel, DeliveryReceipt};
use followup_core::types::SubjectProfile;
use serde::Serialize;

use crate::http;

/// Body posted to the bridge.
#[derive(Debug, Serialize, PartialEq)]
pub struct WebhookPayload<'a> {
    pub phone: &'a str,
    pub message: &'a str,
    pub subject_id: &'a str,
    pub follow_up_id: &'a str,
    pub name: String,
}

impl<'a> WebhookPayload<'a> {
    pub fn new(profile: &'a SubjectProfile, text: &'a str, follow_up_id: &'a str) -> Self {
        Self {
            phone: &profile.contact,
            message: text,
            subject_id: &profile.subject_id,
            follow_up_id,
            name: profile.display_name(),
        }
    }
}

pub struct WebhookDelivery {
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    client: reqwest::Client,
}

impl WebhookDelivery {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(FollowUpError::Config("delivery.webhook_url is empty".into()));
        }
        Ok(Self {
            url: url.trim().to_string(),
            headers: Vec::new(),
            timeout,
            client: reqwest::Client::new(),
        })
    }

    /// `delivery.webhook_url` plus every `delivery.webhook_headers` entry.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        let delivery = Self::new(&config.webhook_url, Duration::from_millis(config.timeout_ms))?;
        Ok(config
            .webhook_headers
            .iter()
            .fold(delivery, |d, (key, value)| d.with_header(key, value)))
    }

    /// Extra header sent with every request (auth tokens and the like).
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl DeliveryChannel for WebhookDelivery {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(
        &self,
        profile: &SubjectProfile,
        text: &str,
        follow_up_id: &str,
    ) -> Result<DeliveryReceipt> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::new(profile, text, follow_up_id))
            .timeout(self.timeout);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await.map_err(|e| http::send_error("webhook", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http::status_error("webhook", status, &body));
        }

        // Bridges that answer with JSON may hand back their own message id.
        let external_id = resp
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| {
                v.get("id")
                    .or_else(|| v.get("message_id"))
                    .map(|id| id.as_str().map(String::from).unwrap_or_else(|| id.to_string()))
            });
        tracing::debug!("✅ Webhook accepted follow-up {}", follow_up_id);
        Ok(DeliveryReceipt { external_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let profile = SubjectProfile {
            subject_id: "sub-1".into(),
            contact: "+15550100".into(),
            first_name: Some("Dana".into()),
            last_name: Some("Reyes".into()),
            timezone: None,
        };
        let json = serde_json::to_value(WebhookPayload::new(&profile, "Hi Dana", "f-1")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "phone": "+15550100",
                "message": "Hi Dana",
                "subject_id": "sub-1",
                "follow_up_id": "f-1",
                "name": "Dana Reyes",
            })
        );
    }

    #[test]
    fn test_empty_url_rejected() {
        assert!(matches!(
            WebhookDelivery::new("  ", Duration::from_secs(1)),
            Err(FollowUpError::Config(_))
        ));
    }

    /// One-shot HTTP server: captures the raw request and answers with `reply`.
    async fn bridge(reply: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .and_then(|v| v.parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                reply.len(),
                reply
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_configured_headers_are_sent() {
        let (url, server) = bridge(r#"{"id":"msg-42"}"#).await;
        let mut config = DeliveryConfig {
            webhook_url: url,
            ..Default::default()
        };
        config
            .webhook_headers
            .insert("X-Bridge-Token".into(), "s3cret".into());
        let channel = WebhookDelivery::from_config(&config).unwrap();
        let profile = SubjectProfile {
            subject_id: "sub-1".into(),
            contact: "+15550100".into(),
            ..Default::default()
        };

        let receipt = channel.deliver(&profile, "Hi", "f-1").await.unwrap();
        assert_eq!(receipt.external_id.as_deref(), Some("msg-42"));
        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.contains("x-bridge-token: s3cret"));
        assert!(request.contains("\"follow_up_id\":\"f-1\""));
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transient() {
        // Port 9 (discard) on localhost is not listening in test environments.
        let channel = WebhookDelivery::new("http://127.0.0.1:9/hook", Duration::from_millis(500)).unwrap();
        let profile = SubjectProfile {
            subject_id: "sub-1".into(),
            contact: "+15550100".into(),
            ..Default::default()
        };
        let err = channel.deliver(&profile, "Hi", "f-1").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
