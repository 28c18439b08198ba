//! Reliable list queue.
//!
//! Producers `RPUSH` JSON payloads onto a plain list. Fetching moves an item
//! to a per-consumer processing list with `BLMOVE`, so a crash between fetch
//! and ack leaves it in Redis for [`recover`](JobSource::recover).
//!
//! `recover` drains this consumer's own processing list and also any other
//! consumer's list that has not been touched for the claim idle time, so
//! items held by a pod that never came back return to the queue.
//!
//! Keys, for queue `q` and consumer `c`:
//! - `q` - pending items
//! - `q:processing:c` - items taken by `c` and not yet settled
//! - `q:attempts` - hash of item id to failed attempts
//! - `q:dead` - JSON [`DeadLetter`] entries

use super::{JobSource, RequeueOutcome, DEFAULT_CLAIM_IDLE, MIN_BLOCK};
use crate::error::FetchError;
use crate::job::{content_id, AckToken, DeadLetter, WorkItem};
use async_trait::async_trait;
use redis::aio::ConnectionLike;
use std::time::Duration;
use tracing::{debug, info, warn};

/// List-backed job source
#[derive(Debug, Clone)]
pub struct RedisListSource {
    queue: String,
    processing: String,
    attempts: String,
    dead: String,
    max_retries: u32,
    claim_idle: Duration,
}

impl RedisListSource {
    pub fn new(queue: impl Into<String>, consumer: &str, max_retries: u32) -> Self {
        let queue = queue.into();

        Self {
            processing: format!("{queue}:processing:{consumer}"),
            attempts: format!("{queue}:attempts"),
            dead: format!("{queue}:dead"),
            queue,
            max_retries,
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }

    /// How long another consumer's processing list must sit untouched
    /// before `recover` takes its items back
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn processing_key(&self) -> &str {
        &self.processing
    }

    pub fn attempts_key(&self) -> &str {
        &self.attempts
    }

    pub fn dead_letter_key(&self) -> &str {
        &self.dead
    }

    /// SCAN pattern matching every consumer's processing list for this queue
    fn processing_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.queue.len() + 13);
        for c in self.queue.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push_str(":processing:*");
        pattern
    }

    /// Move everything in `list` back to the head of the queue, oldest first
    async fn drain<C>(&self, session: &mut C, list: &str) -> Result<usize, FetchError>
    where
        C: ConnectionLike + Send + Sync,
    {
        let mut moved = 0;

        loop {
            let item: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(list)
                .arg(&self.queue)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(session)
                .await?;

            match item {
                Some(_) => moved += 1,
                None => break,
            }
        }

        Ok(moved)
    }

    /// Processing lists of other consumers
    async fn other_processing_lists<C>(&self, session: &mut C) -> Result<Vec<String>, FetchError>
    where
        C: ConnectionLike + Send + Sync,
    {
        let pattern = self.processing_pattern();
        let mut cursor: u64 = 0;
        let mut lists = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(session)
                .await?;

            lists.extend(keys.into_iter().filter(|key| *key != self.processing));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        lists.sort();
        lists.dedup();
        Ok(lists)
    }

    /// Drain other consumers' processing lists idle for at least `claim_idle`
    async fn claim_orphans<C>(&self, session: &mut C) -> Result<usize, FetchError>
    where
        C: ConnectionLike + Send + Sync,
    {
        let min_idle = self.claim_idle.as_secs();
        let mut claimed = 0;

        for list in self.other_processing_lists(session).await? {
            // Seconds since the owner last fetched or settled. Not available
            // under an LFU eviction policy, in which case the list is left alone.
            let idle: Option<u64> = match redis::cmd("OBJECT")
                .arg("IDLETIME")
                .arg(&list)
                .query_async(session)
                .await
            {
                Ok(idle) => idle,
                Err(e) => {
                    warn!(queue = %self.queue, list = %list, error = %e, "Cannot read processing list idle time");
                    continue;
                }
            };

            let Some(idle) = idle.filter(|idle| *idle >= min_idle) else {
                continue;
            };

            let moved = self.drain(session, &list).await?;
            if moved > 0 {
                info!(queue = %self.queue, list = %list, idle_secs = idle, moved, "Claimed abandoned items");
            }
            claimed += moved;
        }

        Ok(claimed)
    }
}

#[async_trait]
impl<C> JobSource<C> for RedisListSource
where
    C: ConnectionLike + Send + Sync,
{
    fn name(&self) -> &str {
        &self.queue
    }

    async fn recover(&mut self, session: &mut C) -> Result<usize, FetchError> {
        let own = self.drain(session, &self.processing).await?;
        if own > 0 {
            info!(queue = %self.queue, recovered = own, "Recovered unsettled items");
        }

        let claimed = self.claim_orphans(session).await?;
        Ok(own + claimed)
    }

    async fn fetch(
        &mut self,
        session: &mut C,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, FetchError> {
        let block = timeout.max(MIN_BLOCK).as_secs_f64();

        let payload: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.queue)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(block)
            .query_async(session)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        let id = content_id(&payload);
        let attempts: Option<u32> = redis::cmd("HGET")
            .arg(&self.attempts)
            .arg(&id)
            .query_async(session)
            .await?;

        debug!(queue = %self.queue, item_id = %id, "Fetched item");

        let token = AckToken::new(id.clone());
        Ok(Some(WorkItem::new(id, payload, attempts.unwrap_or(0), token)))
    }

    async fn acknowledge(&mut self, session: &mut C, item: &WorkItem) -> Result<(), FetchError> {
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(item.payload())
            .ignore()
            .cmd("HDEL")
            .arg(&self.attempts)
            .arg(item.id())
            .ignore()
            .query_async::<()>(session)
            .await?;

        debug!(queue = %self.queue, item_id = %item.id(), "Acknowledged item");
        Ok(())
    }

    async fn requeue(
        &mut self,
        session: &mut C,
        item: WorkItem,
        reason: &str,
    ) -> Result<RequeueOutcome, FetchError> {
        let attempt = item.attempts() + 1;

        if attempt > self.max_retries {
            <Self as JobSource<C>>::dead_letter(self, session, item, reason).await?;
            return Ok(RequeueOutcome::DeadLettered);
        }

        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(item.payload())
            .ignore()
            .cmd("HSET")
            .arg(&self.attempts)
            .arg(item.id())
            .arg(attempt)
            .ignore()
            .cmd("RPUSH")
            .arg(&self.queue)
            .arg(item.payload())
            .ignore()
            .query_async::<()>(session)
            .await?;

        debug!(
            queue = %self.queue,
            item_id = %item.id(),
            attempt,
            max_retries = self.max_retries,
            "Requeued item"
        );

        Ok(RequeueOutcome::Requeued { attempt })
    }

    async fn release(&mut self, session: &mut C, item: WorkItem) -> Result<(), FetchError> {
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(item.payload())
            .ignore()
            .cmd("LPUSH")
            .arg(&self.queue)
            .arg(item.payload())
            .ignore()
            .query_async::<()>(session)
            .await?;

        debug!(queue = %self.queue, item_id = %item.id(), attempts = item.attempts(), "Released item");
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        session: &mut C,
        item: WorkItem,
        reason: &str,
    ) -> Result<(), FetchError> {
        let entry = serde_json::to_string(&DeadLetter::new(&item, reason, &self.queue))?;

        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing)
            .arg(1)
            .arg(item.payload())
            .ignore()
            .cmd("HDEL")
            .arg(&self.attempts)
            .arg(item.id())
            .ignore()
            .cmd("RPUSH")
            .arg(&self.dead)
            .arg(&entry)
            .ignore()
            .query_async::<()>(session)
            .await?;

        warn!(
            queue = %self.queue,
            dead_letter_key = %self.dead,
            item_id = %item.id(),
            attempts = item.attempts() + 1,
            reason = %reason,
            "Moved item to dead-letter list"
        );

        Ok(())
    }
}
