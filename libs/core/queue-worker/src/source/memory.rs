//! In-process job source with the same settle semantics as the Redis ones.
//!
//! Handles are cheap clones over shared state, so a test can keep one to push
//! items and inspect dead letters while the worker owns another.

use super::{JobSource, RequeueOutcome};
use crate::error::{ConnectionError, FetchError};
use crate::job::{AckToken, DeadLetter, WorkItem};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct Entry {
    id: String,
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Entry>,
    in_flight: BTreeMap<u64, Entry>,
    dead: Vec<DeadLetter>,
    acked: usize,
    failing_fetches: u32,
    next_id: u64,
    next_delivery: u64,
}

/// FIFO queue held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    name: String,
    max_retries: u32,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>, max_retries: u32) -> Self {
        Self {
            name: name.into(),
            max_retries,
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a payload, returning its item id
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = format!("mem-{}", inner.next_id);
            inner.pending.push_back(Entry {
                id: id.clone(),
                payload: payload.into(),
                attempts: 0,
            });
            id
        };

        self.notify.notify_one();
        id
    }

    /// Add a payload as already taken by a consumer that will never settle it
    pub fn push_unsettled(&self, payload: impl Into<Vec<u8>>) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.next_delivery += 1;
        let id = format!("mem-{}", inner.next_id);
        let delivery = inner.next_delivery;
        inner.in_flight.insert(
            delivery,
            Entry {
                id: id.clone(),
                payload: payload.into(),
                attempts: 0,
            },
        );
        id
    }

    /// Make the next `n` fetches fail as if the connection dropped
    pub fn fail_next_fetches(&self, n: u32) {
        self.lock().failing_fetches = n;
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn acked_count(&self) -> usize {
        self.lock().acked
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_in_flight(inner: &mut Inner, item: &WorkItem) -> Option<Entry> {
        let delivery = item.ack_token().as_str().parse::<u64>().ok()?;
        inner.in_flight.remove(&delivery)
    }

    fn try_take(&self) -> Result<Option<WorkItem>, FetchError> {
        let mut inner = self.lock();

        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(ConnectionError::Unavailable("connection reset by peer".to_string()).into());
        }

        let Some(entry) = inner.pending.pop_front() else {
            return Ok(None);
        };

        inner.next_delivery += 1;
        let delivery = inner.next_delivery;
        let item = WorkItem::new(
            entry.id.clone(),
            entry.payload.clone(),
            entry.attempts,
            AckToken::new(delivery.to_string()),
        );
        inner.in_flight.insert(delivery, entry);

        Ok(Some(item))
    }
}

#[async_trait]
impl<S: Send + Sync> JobSource<S> for InMemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recover(&mut self, _session: &mut S) -> Result<usize, FetchError> {
        let mut inner = self.lock();
        let in_flight = std::mem::take(&mut inner.in_flight);
        let recovered = in_flight.len();

        for (_, entry) in in_flight.into_iter().rev() {
            inner.pending.push_front(entry);
        }

        Ok(recovered)
    }

    async fn fetch(
        &mut self,
        _session: &mut S,
        timeout: Duration,
    ) -> Result<Option<WorkItem>, FetchError> {
        if let Some(item) = self.try_take()? {
            return Ok(Some(item));
        }

        if tokio::time::timeout(timeout, self.notify.notified()).await.is_err() {
            return Ok(None);
        }

        self.try_take()
    }

    async fn acknowledge(&mut self, _session: &mut S, item: &WorkItem) -> Result<(), FetchError> {
        let mut inner = self.lock();
        if Self::take_in_flight(&mut inner, item).is_some() {
            inner.acked += 1;
        }
        Ok(())
    }

    async fn requeue(
        &mut self,
        session: &mut S,
        item: WorkItem,
        reason: &str,
    ) -> Result<RequeueOutcome, FetchError> {
        let attempt = item.attempts() + 1;

        if attempt > self.max_retries {
            <Self as JobSource<S>>::dead_letter(self, session, item, reason).await?;
            return Ok(RequeueOutcome::DeadLettered);
        }

        {
            let mut inner = self.lock();
            Self::take_in_flight(&mut inner, &item);
            inner.pending.push_back(Entry {
                id: item.id().to_string(),
                payload: item.payload().to_vec(),
                attempts: attempt,
            });
        }
        self.notify.notify_one();

        Ok(RequeueOutcome::Requeued { attempt })
    }

    async fn release(&mut self, _session: &mut S, item: WorkItem) -> Result<(), FetchError> {
        {
            let mut inner = self.lock();
            Self::take_in_flight(&mut inner, &item);
            inner.pending.push_front(Entry {
                id: item.id().to_string(),
                payload: item.payload().to_vec(),
                attempts: item.attempts(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(
        &mut self,
        _session: &mut S,
        item: WorkItem,
        reason: &str,
    ) -> Result<(), FetchError> {
        let entry = DeadLetter::new(&item, reason, &self.name);
        let mut inner = self.lock();
        Self::take_in_flight(&mut inner, &item);
        inner.dead.push(entry);
        Ok(())
    }
}
