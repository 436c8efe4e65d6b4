//! # followup-channels
//!
//! Outbound collaborators for the follow-up scheduler: delivery channels
//! (HTTP webhook bridge, Telegram Bot API) and message personalizers
//! (placeholder template, OpenAI-compatible LLM).

pub mod http;
pub mod personalize;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use followup_core::config::{DeliveryConfig, PersonalizationConfig};
use followup_core::error::{FollowUpError, Result};
use followup_core::traits::{DeliveryChannel, Personalizer};

pub use personalize::{LlmPersonalizer, TemplatePersonalizer};
pub use telegram::TelegramDelivery;
pub use webhook::WebhookDelivery;

/// Delivery channel named by `delivery.channel`.
pub fn delivery_from_config(config: &DeliveryConfig) -> Result<Arc<dyn DeliveryChannel>> {
    let timeout = Duration::from_millis(config.timeout_ms);
    match config.channel.as_str() {
        "webhook" => Ok(Arc::new(WebhookDelivery::from_config(config)?)),
        "telegram" => Ok(Arc::new(TelegramDelivery::new(&config.telegram_bot_token, timeout)?)),
        other => Err(FollowUpError::Config(format!("unknown delivery channel '{other}'"))),
    }
}

/// LLM personalizer when enabled and usable, otherwise placeholder filling.
pub fn personalizer_from_config(config: &PersonalizationConfig) -> Arc<dyn Personalizer> {
    if !config.enabled {
        return Arc::new(TemplatePersonalizer);
    }
    match LlmPersonalizer::from_config(config) {
        Ok(llm) => {
            tracing::info!("🧠 LLM personalization enabled ({})", config.model);
            Arc::new(llm)
        }
        Err(e) => {
            tracing::warn!("⚠️ LLM personalization disabled: {e}");
            Arc::new(TemplatePersonalizer)
        }
    }
}
