//! Enrichment step run for every queued listing

use crate::detail_api::DetailApi;
use crate::storage::{object_key, ObjectSink};
use async_trait::async_trait;
use chrono::Utc;
use queue_worker::{ProcessingError, WorkItem, WorkProcessor};
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Message shape: a JSON object with at least an absolute `link`. Every other
/// field is carried through to the stored document.
pub struct DetailProcessor<A, S> {
    api: A,
    sink: S,
}

impl<A, S> DetailProcessor<A, S> {
    pub fn new(api: A, sink: S) -> Self {
        Self { api, sink }
    }
}

fn parse_message(payload: &[u8]) -> Result<Map<String, Value>, ProcessingError> {
    match serde_json::from_slice(payload) {
        Ok(Value::Object(message)) => Ok(message),
        Ok(_) => Err(ProcessingError::permanent("message is not a JSON object")),
        Err(e) => Err(ProcessingError::permanent(format!("message is not valid JSON: {e}"))),
    }
}

/// The `link` field, if it is an absolute URL with both scheme and host
fn valid_link(message: &Map<String, Value>) -> Result<&str, ProcessingError> {
    let link = message
        .get("link")
        .and_then(Value::as_str)
        .ok_or_else(|| ProcessingError::permanent("message has no link"))?;

    let has_host = Url::parse(link)
        .map(|url| url.host_str().is_some_and(|host| !host.is_empty()))
        .unwrap_or(false);

    if has_host {
        Ok(link)
    } else {
        Err(ProcessingError::permanent(format!("invalid link: {link:?}")))
    }
}

/// Message fields overlaid by the API's fields
fn merge(mut message: Map<String, Value>, detail: Map<String, Value>) -> Map<String, Value> {
    message.extend(detail);
    message
}

#[async_trait]
impl<A, S> WorkProcessor for DetailProcessor<A, S>
where
    A: DetailApi + 'static,
    S: ObjectSink + 'static,
{
    fn name(&self) -> &'static str {
        "detail"
    }

    async fn process(&self, item: &WorkItem) -> Result<(), ProcessingError> {
        let message = parse_message(item.payload())?;
        let link = valid_link(&message)?.to_string();
        let name = message.get("name").and_then(Value::as_str).unwrap_or("Unknown").to_string();

        info!(item_id = %item.id(), name = %name, link = %link, "Processing listing");

        let detail = self.api.fetch_detail(&link).await.map_err(|e| {
            warn!(item_id = %item.id(), link = %link, error = %e, "Detail lookup failed");
            if e.is_retryable() {
                ProcessingError::transient(e.to_string())
            } else {
                ProcessingError::permanent(e.to_string())
            }
        })?;

        let document = Value::Object(merge(message, detail));
        let body = serde_json::to_vec(&document).map_err(|e| ProcessingError::permanent(e.to_string()))?;

        let key = object_key(&Utc::now());
        self.sink
            .put_json(&key, body)
            .await
            .map_err(|e| ProcessingError::transient(e.to_string()))?;

        info!(item_id = %item.id(), key = %key, "Stored enriched listing");
        Ok(())
    }
}
