use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::sleep;

use crate::api::AppState;
use crate::ingest::queue::QueueSource;
use crate::ingest::{self, Disposition};

/// Object-created notification, in the shape object stores publish to their
/// event queues.
#[derive(Debug, Deserialize)]
pub struct ObjectEventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<ObjectEventRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEventRecord {
    pub event_name: String,
    pub s3: ObjectEntity,
}

#[derive(Debug, Deserialize)]
pub struct ObjectEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub key: String,
}

/// Fragment bodies parked in an object store, read once and deleted after
/// their submission settles.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the object is gone, which happens when another worker
    /// already consumed it.
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, String>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), String>;
}

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("object store client build failed: {err}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, key)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, String> {
        let response = self
            .client
            .get(self.object_url(bucket, key))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|err| format!("object fetch failed: {err}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!(
                "object fetch answered status {}",
                response.status().as_u16()
            ));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("object body read failed: {err}"))?;
        Ok(Some(body))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), String> {
        let response = self
            .client
            .delete(self.object_url(bucket, key))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|err| format!("object delete failed: {err}"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(format!(
                "object delete answered status {}",
                response.status().as_u16()
            ));
        }
        Ok(())
    }
}

pub fn spawn_object_events_ingest(
    state: AppState,
    events: Arc<dyn QueueSource>,
    objects: Arc<dyn ObjectStore>,
) {
    tokio::spawn(async move {
        loop {
            let processed =
                object_events_once(&state, events.as_ref(), objects.as_ref()).await;
            if processed == 0 {
                sleep(state.config.poll_idle).await;
            }
        }
    });
}

pub(crate) async fn object_events_once(
    state: &AppState,
    events: &dyn QueueSource,
    objects: &dyn ObjectStore,
) -> usize {
    let deliveries = match events.receive(state.config.poll_batch).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            tracing::warn!(error = %err, "event receive failed");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["object_events", "receive"])
                .inc();
            return 0;
        }
    };
    let mut processed = 0;
    for delivery in deliveries {
        processed += 1;
        match process_event(state, objects, &delivery.body).await {
            Disposition::Settle => {
                if let Err(err) = events.settle(delivery.receipt).await {
                    tracing::warn!(error = %err, "event ack failed; notification will reappear");
                }
            }
            Disposition::Retry => {}
        }
    }
    processed
}

async fn process_event(state: &AppState, objects: &dyn ObjectStore, body: &[u8]) -> Disposition {
    let event: ObjectEventNotification = match serde_json::from_slice(body) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "dropping undecodable object event");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["object_events", "decode"])
                .inc();
            return Disposition::Settle;
        }
    };
    for record in &event.records {
        if !record.event_name.starts_with("ObjectCreated") {
            continue;
        }
        if process_created_object(state, objects, record).await == Disposition::Retry {
            return Disposition::Retry;
        }
    }
    Disposition::Settle
}

async fn process_created_object(
    state: &AppState,
    objects: &dyn ObjectStore,
    record: &ObjectEventRecord,
) -> Disposition {
    let bucket = &record.s3.bucket.name;
    let key = &record.s3.object.key;
    let body = match objects.fetch(bucket, key).await {
        Ok(Some(body)) => body,
        Ok(None) => {
            tracing::debug!(bucket, key, "object already consumed");
            return Disposition::Settle;
        }
        Err(err) => {
            tracing::warn!(bucket, key, error = %err, "object fetch failed");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["object_events", "fetch"])
                .inc();
            return Disposition::Retry;
        }
    };
    match ingest::submit_raw(state, "object_events", &body).await {
        Disposition::Settle => {
            // Delete only after the submission settled; a redelivered event
            // for a still-present object resubmits an idempotent duplicate.
            if let Err(err) = objects.delete(bucket, key).await {
                tracing::warn!(bucket, key, error = %err, "object delete failed");
                return Disposition::Retry;
            }
            Disposition::Settle
        }
        Disposition::Retry => Disposition::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::{object_events_once, HttpObjectStore, ObjectStore};
    use crate::test_support::{self, MemoryObjectStore, MemoryQueueSource};
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn created_event(bucket: &str, key: &str) -> Vec<u8> {
        format!(
            r#"{{"Records":[{{"eventName":"ObjectCreated:Put","s3":{{"bucket":{{"name":"{bucket}"}},"object":{{"key":"{key}"}}}}}}]}}"#
        )
        .into_bytes()
    }

    fn removed_event(bucket: &str, key: &str) -> Vec<u8> {
        format!(
            r#"{{"Records":[{{"eventName":"ObjectRemoved:Delete","s3":{{"bucket":{{"name":"{bucket}"}},"object":{{"key":"{key}"}}}}}}]}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn created_objects_are_submitted_then_deleted() {
        let (state, _store, forwarder) = test_support::memory_state();
        let events = MemoryQueueSource::new();
        let objects = MemoryObjectStore::new();
        objects.put(
            "inbox",
            "frag-1",
            br#"{"Id":"m1","PartNumber":0,"TotalParts":1,"Data":"whole"}"#,
        );
        events.push(&created_event("inbox", "frag-1"));

        let processed = object_events_once(&state, &events, &objects).await;
        assert_eq!(processed, 1);
        assert_eq!(events.pending(), 0);
        assert!(!objects.contains("inbox", "frag-1"));
        assert_eq!(
            forwarder.sent(),
            vec![("m1".to_string(), b"whole".to_vec())]
        );
    }

    #[tokio::test]
    async fn non_create_events_are_skipped_and_settled() {
        let (state, _store, forwarder) = test_support::memory_state();
        let events = MemoryQueueSource::new();
        let objects = MemoryObjectStore::new();
        events.push(&removed_event("inbox", "frag-1"));

        object_events_once(&state, &events, &objects).await;
        assert_eq!(events.pending(), 0);
        assert!(forwarder.sent().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_settle_the_event() {
        let (state, _store, forwarder) = test_support::memory_state();
        let events = MemoryQueueSource::new();
        let objects = MemoryObjectStore::new();
        events.push(&created_event("inbox", "gone"));

        object_events_once(&state, &events, &objects).await;
        assert_eq!(events.pending(), 0);
        assert!(forwarder.sent().is_empty());
    }

    #[tokio::test]
    async fn store_outage_keeps_event_and_object_for_redelivery() {
        let (state, store, forwarder) = test_support::memory_state();
        let events = MemoryQueueSource::new();
        let objects = MemoryObjectStore::new();
        objects.put(
            "inbox",
            "frag-1",
            br#"{"Id":"m1","PartNumber":0,"TotalParts":1,"Data":"whole"}"#,
        );
        events.push(&created_event("inbox", "frag-1"));

        store.set_unavailable(true);
        object_events_once(&state, &events, &objects).await;
        assert_eq!(events.pending(), 1);
        assert!(objects.contains("inbox", "frag-1"));

        store.set_unavailable(false);
        object_events_once(&state, &events, &objects).await;
        assert_eq!(events.pending(), 0);
        assert!(!objects.contains("inbox", "frag-1"));
        assert_eq!(forwarder.sent().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_events_are_settled() {
        let (state, _store, _forwarder) = test_support::memory_state();
        let events = MemoryQueueSource::new();
        let objects = MemoryObjectStore::new();
        events.push(b"[not an event]");

        object_events_once(&state, &events, &objects).await;
        assert_eq!(events.pending(), 0);
    }

    #[tokio::test]
    async fn http_object_store_fetches_and_reports_missing_objects() {
        let (tx, rx) = oneshot::channel::<()>();
        let app = Router::new().route(
            "/objects/{bucket}/{key}",
            get(|Path((_, key)): Path<(String, String)>| async move {
                if key == "present" {
                    (StatusCode::OK, "payload".to_string())
                } else {
                    (StatusCode::NOT_FOUND, String::new())
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });

        let store = HttpObjectStore::new(
            &format!("http://{addr}/objects"),
            "token",
            Duration::from_secs(2),
        )
        .expect("store");
        let body = store.fetch("inbox", "present").await.expect("fetch");
        assert_eq!(body.map(|bytes| bytes.to_vec()), Some(b"payload".to_vec()));
        let missing = store.fetch("inbox", "absent").await.expect("fetch");
        assert!(missing.is_none());

        let _ = tx.send(());
        let _ = task.await;
    }
}
