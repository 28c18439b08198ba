//! Redis Streams consumer group source.
//!
//! Entries carry a `payload` field and an optional `attempts` field. Field
//! values are raw bytes, so payloads need not be UTF-8. A retry is a fresh
//! `XADD` with `attempts + 1` followed by `XACK` of the original entry; dead
//! letters go to `<stream>:dlq`.
//!
//! `recover` also `XCLAIM`s entries other consumers of the group have left
//! pending past the claim idle time.

use super::{JobSource, RequeueOutcome, DEFAULT_CLAIM_IDLE, MIN_BLOCK};
use crate::error::FetchError;
use crate::job::{AckToken, DeadLetter, WorkItem};
use async_trait::async_trait;
use redis::aio::ConnectionLike;
use redis::RedisResult;
use std::time::Duration;
use tracing::{debug, info, warn};

type Fields = Vec<(Vec<u8>, Vec<u8>)>;

// XREADGROUP reply: [(stream, [(entry id, [(field, value)] | nil)])]. Fields
// are nil for an entry deleted after it was delivered.
type StreamReply = Vec<(String, Vec<(String, Option<Fields>)>)>;

// XPENDING extended form: (entry id, consumer, idle ms, delivery count)
type PendingEntry = (String, String, u64, u64);

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPTS_FIELD: &str = "attempts";
const PENDING_BATCH: usize = 1000;

/// One entry read from the group
#[derive(Debug)]
enum StreamEntry {
    Job(WorkItem),
    /// Still pending but no longer in the stream
    Deleted { entry_id: String },
    /// No `payload` field; carries the field names that were present
    Malformed { item: WorkItem, fields: Vec<String> },
}

impl StreamEntry {
    fn decode(entry_id: String, fields: Option<Fields>) -> Self {
        let Some(mut fields) = fields else {
            return Self::Deleted { entry_id };
        };

        let attempts = fields
            .iter()
            .find(|(k, _)| k == ATTEMPTS_FIELD.as_bytes())
            .and_then(|(_, v)| std::str::from_utf8(v).ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let token = AckToken::new(entry_id.clone());

        let payload_at = fields.iter().position(|(k, _)| k == PAYLOAD_FIELD.as_bytes());

        match payload_at {
            Some(at) => {
                let (_, payload) = fields.swap_remove(at);
                Self::Job(WorkItem::new(entry_id, payload, attempts, token))
            }
            None => Self::Malformed {
                fields: fields.iter().map(|(k, _)| String::from_utf8_lossy(k).into_owned()).collect(),
                item: WorkItem::new(entry_id, Vec::new(), attempts, token),
            },
        }
    }
}

fn is_nogroup(e: &redis::RedisError) -> bool {
    e.to_string().contains("NOGROUP")
}

/// Consumer-group job source
#[derive(Debug, Clone)]
pub struct RedisStreamSource {
    stream: String,
    group: String,
    consumer: String,
    dlq: String,
    dlq_max_len: u64,
    max_retries: u32,
    claim_idle: Duration,
    group_ready: bool,
    backlog_drained: bool,
}

impl RedisStreamSource {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        let stream = stream.into();

        Self {
            dlq: format!("{stream}:dlq"),
            stream,
            group: group.into(),
            consumer: consumer.into(),
            dlq_max_len: 10_000,
            max_retries,
            claim_idle: DEFAULT_CLAIM_IDLE,
            group_ready: false,
            backlog_drained: false,
        }
    }

    /// Approximate cap on the dead-letter stream length
    pub fn with_dlq_max_len(mut self, max_len: u64) -> Self {
        self.dlq_max_len = max_len;
        self
    }

    /// How long an entry must sit pending with another consumer before
    /// `recover` claims it
    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle = idle;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn dead_letter_stream(&self) -> &str {
        &self.dlq
    }

    async fn ensure_group<C: ConnectionLike + Send>(&mut self, session: &mut C) -> Result<(), FetchError> {
        if self.group_ready {
            return Ok(());
        }

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(session)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        self.group_ready = true;
        Ok(())
    }

    async fn read<C: ConnectionLike + Send>(
        &mut self,
        session: &mut C,
        timeout: Duration,
    ) -> RedisResult<Option<StreamReply>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer);

        // Own pending entries first, then block for new ones
        let from = if self.backlog_drained {
            let block_ms = timeout.max(MIN_BLOCK).as_millis() as u64;
            cmd.arg("BLOCK").arg(block_ms);
            ">"
        } else {
            "0"
        };

        cmd.arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(from);

        cmd.query_async(session).await
    }

    fn first_entry(reply: StreamReply) -> Option<(String, Option<Fields>)> {
        reply
            .into_iter()
            .flat_map(|(_stream, entries)| entries)
            .next()
    }

    async fn pending<C: ConnectionLike + Send>(&self, session: &mut C) -> RedisResult<Vec<PendingEntry>> {
        redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(PENDING_BATCH)
            .query_async(session)
            .await
    }

    /// Take over the `pending` entries other consumers have held for at
    /// least `claim_idle`
    async fn claim_abandoned<C: ConnectionLike + Send>(
        &self,
        session: &mut C,
        pending: Vec<PendingEntry>,
    ) -> RedisResult<Vec<String>> {
        let min_idle = self.claim_idle.as_millis() as u64;

        let ids: Vec<String> = pending
            .into_iter()
            .filter(|(_, consumer, idle, _)| *consumer != self.consumer && *idle >= min_idle)
            .map(|(id, ..)| id)
            .collect();

        if ids.is_empty() {
            return Ok(ids);
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle)
            .arg(&ids)
            .arg("JUSTID");

        cmd.query_async(session).await
    }
}

#[async_trait]
impl<C> JobSource<C> for RedisStreamSource
where
    C: ConnectionLike + Send + Sync,
{
    fn name(&self) -> &str {
        &self.stream
    }

    async fn recover(&mut self, session: &mut C) -> Result<usize, FetchError> {
        self.ensure_group(session).await?;

        let (own, claimed) = match self.pending(session).await {
            Ok(pending) => {
                let own = pending.iter().filter(|(_, consumer, ..)| *consumer == self.consumer).count();
                (own, self.claim_abandoned(session, pending).await?)
            }
            Err(e) if is_nogroup(&e) => {
                warn!(stream = %self.stream, group = %self.group, "Consumer group missing");
                self.group_ready = false;
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        // Own and claimed entries are redelivered by the next reads from id 0
        self.backlog_drained = false;

        if own > 0 {
            info!(stream = %self.stream, consumer = %self.consumer, recovered = own, "Recovered unacknowledged entries");
        }
        if !claimed.is_empty() {
            info!(
                stream = %self.stream,
                consumer = %self.consumer,
                claimed = claimed.len(),
                "Claimed entries abandoned by other consumers"
            );
        }

        Ok(own + claimed.len())
    }

    async fn fetch(
        &mut self,
        session: &mut C,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, FetchError> {
        self.ensure_group(session).await?;

        loop {
            let reply = match self.read(session, timeout).await {
                Ok(reply) => reply,
                Err(e) if is_nogroup(&e) => {
                    // Stream or group deleted underneath us; recreate on next fetch
                    warn!(stream = %self.stream, group = %self.group, "Consumer group missing");
                    self.group_ready = false;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            let Some((entry_id, fields)) = reply.and_then(Self::first_entry) else {
                if self.backlog_drained {
                    return Ok(None);
                }
                self.backlog_drained = true;
                continue;
            };

            match StreamEntry::decode(entry_id, fields) {
                StreamEntry::Job(item) => {
                    debug!(stream = %self.stream, entry_id = %item.id(), attempts = item.attempts(), "Fetched entry");
                    return Ok(Some(item));
                }
                StreamEntry::Deleted { entry_id } => {
                    warn!(stream = %self.stream, entry_id = %entry_id, "Pending entry no longer exists, acknowledging");
                    let _: i64 = redis::cmd("XACK")
                        .arg(&self.stream)
                        .arg(&self.group)
                        .arg(&entry_id)
                        .query_async(session)
                        .await?;
                }
                StreamEntry::Malformed { item, fields } => {
                    warn!(
                        stream = %self.stream,
                        entry_id = %item.id(),
                        fields = ?fields,
                        "Missing 'payload' field in entry"
                    );
                    <Self as JobSource<C>>::dead_letter(self, session, item, "missing payload field").await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn acknowledge(&mut self, session: &mut C, item: &WorkItem) -> Result<(), FetchError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(item.ack_token().as_str())
            .query_async(session)
            .await?;

        debug!(stream = %self.stream, entry_id = %item.id(), "Acknowledged entry");
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
            .cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(item.payload())
            .arg(ATTEMPTS_FIELD)
            .arg(attempt)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(item.ack_token().as_str())
            .ignore()
            .query_async::<()>(session)
            .await?;

        debug!(
            stream = %self.stream,
            entry_id = %item.id(),
            attempt,
            max_retries = self.max_retries,
            "Requeued entry"
        );

        Ok(RequeueOutcome::Requeued { attempt })
    }

    async fn release(&mut self, session: &mut C, item: WorkItem) -> Result<(), FetchError> {
        // Streams cannot insert at the head, so the item rejoins at the tail
        // with its attempt count untouched.
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(item.payload())
            .arg(ATTEMPTS_FIELD)
            .arg(item.attempts())
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(item.ack_token().as_str())
            .ignore()
            .query_async::<()>(session)
            .await?;

        debug!(stream = %self.stream, entry_id = %item.id(), attempts = item.attempts(), "Released entry");
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        session: &mut C,
        item: WorkItem,
        reason: &str,
    ) -> Result<(), FetchError> {
        let entry = serde_json::to_string(&DeadLetter::new(&item, reason, &self.stream))?;

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&self.dlq)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.dlq_max_len)
            .arg("*")
            .arg("data")
            .arg(&entry)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(item.ack_token().as_str())
            .ignore()
            .query_async::<()>(session)
            .await?;

        warn!(
            stream = %self.stream,
            dlq = %self.dlq,
            entry_id = %item.id(),
            attempts = item.attempts() + 1,
            reason = %reason,
            "Moved entry to DLQ"
        );

        Ok(())
    }
}
