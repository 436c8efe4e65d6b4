use async_trait::async_trait;

use crate::error::Result;
use crate::types::SubjectProfile;

/// Resolves a subject id to contact details and names.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn profile(&self, subject_id: &str) -> Result<SubjectProfile>;
}
