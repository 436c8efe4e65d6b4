//! Telegram Bot API delivery: `sendMessage` to the subject's chat id.

use std::time::Duration;

use async_trait::async_trait;
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::{DeliveryChannel, DeliveryReceipt};
use followup_core::types::SubjectProfile;

use crate::http;

const API_BASE: &str = "https://api.telegram.org";

pub struct TelegramDelivery {
    bot_token: String,
    api_base: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl TelegramDelivery {
    pub fn new(bot_token: &str, timeout: Duration) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(FollowUpError::Config("delivery.telegram_bot_token is empty".into()));
        }
        Ok(Self {
            bot_token: bot_token.trim().to_string(),
            api_base: API_BASE.to_string(),
            timeout,
            client: reqwest::Client::new(),
        })
    }

    /// Point at a Bot API compatible server (local bot server, test double).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    fn send_url(&self) -> String {
        format!("{}/bot{}/sendMessage", self.api_base, self.bot_token)
    }
}

/// Pull `result.message_id` out of a Bot API reply.
fn message_id(reply: &serde_json::Value) -> Option<String> {
    reply["result"]["message_id"].as_i64().map(|id| id.to_string())
}

#[async_trait]
impl DeliveryChannel for TelegramDelivery {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(
        &self,
        profile: &SubjectProfile,
        text: &str,
        follow_up_id: &str,
    ) -> Result<DeliveryReceipt> {
        // Plain text: personalized messages are not Markdown-safe.
        let resp = self
            .client
            .post(self.send_url())
            .json(&serde_json::json!({
                "chat_id": profile.contact,
                "text": text,
            }))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| http::send_error("telegram", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http::status_error("telegram", status, &body));
        }

        let reply: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FollowUpError::transient(format!("telegram reply unreadable: {e}")))?;
        if reply["ok"].as_bool() != Some(true) {
            return Err(FollowUpError::permanent(format!(
                "telegram refused message: {}",
                reply["description"].as_str().unwrap_or("unknown error")
            )));
        }
        tracing::debug!("✅ Telegram message sent for follow-up {}", follow_up_id);
        Ok(DeliveryReceipt {
            external_id: message_id(&reply),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_url() {
        let tg = TelegramDelivery::new("123:abc", Duration::from_secs(10)).unwrap();
        assert_eq!(tg.send_url(), "https://api.telegram.org/bot123:abc/sendMessage");
        let local = tg.with_api_base("http://localhost:8081/");
        assert_eq!(local.send_url(), "http://localhost:8081/bot123:abc/sendMessage");
    }

    #[test]
    fn test_message_id_from_reply() {
        let reply = serde_json::json!({"ok": true, "result": {"message_id": 42}});
        assert_eq!(message_id(&reply).as_deref(), Some("42"));
        assert_eq!(message_id(&serde_json::json!({"ok": true})), None);
    }

    #[test]
    fn test_missing_token() {
        assert!(TelegramDelivery::new("", Duration::from_secs(1)).is_err());
    }
}
