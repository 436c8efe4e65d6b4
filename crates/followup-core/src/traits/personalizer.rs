//! Personalizer trait: rewrites a template into the final outbound text.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SubjectProfile;

/// Everything a personalizer may use to produce the final message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalizationRequest {
    pub follow_up_id: String,
    pub kind: String,
    pub template: String,
    pub tone: String,
    pub context_hints: serde_json::Value,
    pub profile: SubjectProfile,
}

#[async_trait]
pub trait Personalizer: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the outbound text. Callers fall back to the raw template on error.
    async fn personalize(&self, request: &PersonalizationRequest) -> Result<String>;
}
