use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{EngagementSample, ResponseSample};

/// Historical timing signals for the send-time predictor.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Delivered follow-ups for `subject_id` sent at or after `since`.
    async fn response_samples(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ResponseSample>>;

    /// Engagement events for `subject_id` at or after `since`.
    async fn engagement_samples(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EngagementSample>>;
}
