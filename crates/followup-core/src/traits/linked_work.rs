use async_trait::async_trait;

use crate::error::Result;
use crate::types::LinkedWorkStatus;

/// Read-only view of the external work items follow-ups can be linked to.
#[async_trait]
pub trait LinkedWorkLookup: Send + Sync {
    /// `Err(NotFound)` when the id is unknown.
    async fn status(&self, linked_work_id: &str) -> Result<LinkedWorkStatus>;
}
