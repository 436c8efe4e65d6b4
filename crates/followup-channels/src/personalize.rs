//! Message personalizers.
//!
//! - [`TemplatePersonalizer`] only fills name placeholders.
//! - [`LlmPersonalizer`] asks any OpenAI-compatible chat completions API to
//!   rewrite the template for the subject.

use std::time::Duration;

use async_trait::async_trait;
use followup_core::config::PersonalizationConfig;
use followup_core::error::{FollowUpError, Result};
use followup_core::template::fill_placeholders;
use followup_core::traits::{PersonalizationRequest, Personalizer};
use serde_json::{Value, json};

/// Placeholder substitution, no network.
pub struct TemplatePersonalizer;

#[async_trait]
impl Personalizer for TemplatePersonalizer {
    fn name(&self) -> &str {
        "template"
    }

    async fn personalize(&self, request: &PersonalizationRequest) -> Result<String> {
        Ok(fill_placeholders(&request.template, &request.profile))
    }
}

const SYSTEM_PROMPT: &str = "You write short, natural follow-up text messages on behalf of a \
    business coach. Reply with the message text only.";

pub struct LlmPersonalizer {
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl LlmPersonalizer {
    pub fn from_config(config: &PersonalizationConfig) -> Result<Self> {
        let endpoint = config.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(FollowUpError::Config("personalization.endpoint is empty".into()));
        }
        Ok(Self {
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            client: reqwest::Client::new(),
        })
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

/// User prompt for one follow-up.
pub fn build_prompt(request: &PersonalizationRequest) -> String {
    let first_name = request.profile.first_name.as_deref().unwrap_or("there");
    let hints = if request.context_hints.is_null() {
        "{}".to_string()
    } else {
        request.context_hints.to_string()
    };
    format!(
        "Personalize this follow-up message for {first_name}:\n\n\
         Template: \"{}\"\n\n\
         Context:\n\
         - Recipient: {}\n\
         - Follow-up type: {}\n\
         - Tone: {}\n\n\
         Additional context: {hints}\n\n\
         Make it natural, conversational, and appropriate for SMS. \
         Keep it under 160 characters if possible. \
         Do not use emojis unless the original template has them.",
        request.template,
        request.profile.display_name(),
        request.kind,
        request.tone,
    )
}

/// First choice's content from a chat completions reply.
fn completion_text(reply: &Value) -> Option<String> {
    reply["choices"]
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.trim().trim_matches('"').trim().to_string())
        .filter(|s| !s.is_empty())
}

#[async_trait]
impl Personalizer for LlmPersonalizer {
    fn name(&self) -> &str {
        "llm"
    }

    async fn personalize(&self, request: &PersonalizationRequest) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.7,
            "max_tokens": 200,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(request) },
            ],
        });

        let url = format!("{}/chat/completions", self.endpoint);
        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .timeout(self.timeout);
        let resp = self.apply_auth(req).send().await.map_err(|e| {
            FollowUpError::Personalization(format!("connection failed ({url}): {e}"))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FollowUpError::Personalization(format!("API error {status}: {text}")));
        }

        let reply: Value = resp
            .json()
            .await
            .map_err(|e| FollowUpError::Personalization(e.to_string()))?;
        let text = completion_text(&reply)
            .ok_or_else(|| FollowUpError::Personalization("no content in response".into()))?;
        tracing::debug!("🧠 Personalized follow-up {} with {}", request.follow_up_id, self.model);
        Ok(text)
    }
}
