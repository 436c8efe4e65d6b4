//! Delivery channel trait: the thing that actually puts a message in front of a user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::SubjectProfile;

/// What the channel reports back after accepting a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeliveryReceipt {
    /// Provider-side id if the channel returns one.
    pub external_id: Option<String>,
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel name for logs ("webhook", "telegram", ...).
    fn name(&self) -> &str;

    /// Deliver `text` to `profile.contact`.
    ///
    /// Transient failures must come back as a retryable error
    /// (`FollowUpError::transient`), unrecoverable ones as
    /// `FollowUpError::permanent`.
    async fn deliver(
        &self,
        profile: &SubjectProfile,
        text: &str,
        follow_up_id: &str,
    ) -> Result<DeliveryReceipt>;
}
