use crate::error::ProcessingError;
use crate::job::WorkItem;
use async_trait::async_trait;

/// Business logic applied to each work item.
///
/// Return `Ok(())` when the item is done, a transient [`ProcessingError`] to
/// have it retried, or a permanent one to dead-letter it. The worker calls
/// `process` exactly once per delivery.
#[async_trait]
pub trait WorkProcessor: Send + Sync + 'static {
    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    async fn process(&self, item: &WorkItem) -> Result<(), ProcessingError>;
}
