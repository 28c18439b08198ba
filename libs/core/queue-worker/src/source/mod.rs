//! Job source adapters.
//!
//! A [`JobSource`] pulls [`WorkItem`]s over a session owned by the
//! [`RedisConnector`](crate::RedisConnector) and settles them once processed.
//! The session is passed into every call so the source never holds a
//! connection of its own.

mod list;
mod memory;
mod stream;

pub use list::RedisListSource;
pub use memory::InMemorySource;
pub use stream::RedisStreamSource;

use crate::error::FetchError;
use crate::job::WorkItem;
use async_trait::async_trait;
use std::time::Duration;

/// What happened to an item handed back with [`JobSource::requeue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Returned to the queue; `attempt` failed attempts recorded so far
    Requeued { attempt: u32 },
    /// Retry ceiling reached, moved to the dead-letter destination
    DeadLettered,
}

/// Pulls work items and settles them.
///
/// Delivery is at-least-once. Implementations keep FIFO order within one
/// queue and make no promise across queues.
#[async_trait]
pub trait JobSource<S: Send>: Send {
    /// Queue or stream name, used in logs and dead-letter entries
    fn name(&self) -> &str;

    /// Reclaim items this consumer took but never settled, plus items other
    /// consumers have left idle past the claim threshold.
    ///
    /// Called after (re)connecting and periodically while running. Returns
    /// how many items were reclaimed.
    async fn recover(&mut self, _session: &mut S) -> Result<usize, FetchError> {
        Ok(0)
    }

    /// Wait up to `timeout` for the next item. `Ok(None)` means nothing arrived.
    async fn fetch(
        &mut self,
        session: &mut S,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, FetchError>;

    /// Mark an item as done. Acknowledging twice has no further effect.
    async fn acknowledge(&mut self, session: &mut S, item: &WorkItem) -> Result<(), FetchError>;

    /// Hand an item back for another attempt, or dead-letter it once the
    /// retry ceiling is reached.
    async fn requeue(
        &mut self,
        session: &mut S,
        item: WorkItem,
        reason: &str,
    ) -> Result<RequeueOutcome, FetchError>;

    /// Put an item back at the head of the queue without counting an attempt.
    ///
    /// Used for items that were never judged, such as work cut short by
    /// shutdown. Never dead-letters.
    async fn release(&mut self, session: &mut S, item: WorkItem) -> Result<(), FetchError>;

    /// Move an item straight to the dead-letter destination
    async fn dead_letter(
        &mut self,
        session: &mut S,
        item: WorkItem,
        reason: &str,
    ) -> Result<(), FetchError>;
}

/// How long another consumer's unsettled items must sit idle before
/// `recover` claims them
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(300);

/// Smallest blocking window sent to Redis; a zero timeout would block forever.
pub(crate) const MIN_BLOCK: Duration = Duration::from_millis(10);
