use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::time::sleep;

use crate::api::AppState;
use crate::ingest::{self, Disposition};

/// One record tailed from an append-only stream. Offsets are strictly
/// increasing within a stream.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub offset: i64,
    pub body: Bytes,
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Records with offsets strictly greater than `after_offset`, in offset
    /// order.
    async fn read(&self, after_offset: i64, max: usize) -> Result<Vec<StreamRecord>, String>;
}

#[derive(Debug, Deserialize)]
struct WireStreamRecord {
    offset: i64,
    data: serde_json::Value,
}

pub struct HttpStreamSource {
    client: reqwest::Client,
    base_url: String,
    stream_id: String,
}

impl HttpStreamSource {
    pub fn new(base_url: &str, stream_id: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("stream client build failed: {err}"))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            stream_id: stream_id.to_string(),
        })
    }
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn read(&self, after_offset: i64, max: usize) -> Result<Vec<StreamRecord>, String> {
        let url = format!(
            "{}/streams/{}/records?after={}&limit={}",
            self.base_url, self.stream_id, after_offset, max
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("stream read failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "stream read answered status {}",
                response.status().as_u16()
            ));
        }
        let records: Vec<WireStreamRecord> = response
            .json()
            .await
            .map_err(|err| format!("stream body decode failed: {err}"))?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let body = serde_json::to_vec(&record.data)
                .map_err(|err| format!("stream record encode failed: {err}"))?;
            out.push(StreamRecord {
                offset: record.offset,
                body: Bytes::from(body),
            });
        }
        Ok(out)
    }
}

pub fn spawn_stream_ingest(state: AppState, source: Arc<dyn StreamSource>) {
    tokio::spawn(async move {
        loop {
            let processed = stream_ingest_once(&state, source.as_ref()).await;
            if processed == 0 {
                sleep(state.config.poll_idle).await;
            }
        }
    });
}

/// Reads one batch after the durable checkpoint and advances the checkpoint
/// past every record whose submission settled. A retry-class result stops the
/// batch so the same record is read again next tick.
pub(crate) async fn stream_ingest_once(state: &AppState, source: &dyn StreamSource) -> usize {
    let stream_id = state.config.stream_id.as_str();
    let committed = match state.repo.stream_checkpoint(stream_id).await {
        Ok(offset) => offset,
        Err(err) => {
            tracing::warn!(stream_id, error = %err, "checkpoint read failed");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["stream", "checkpoint"])
                .inc();
            return 0;
        }
    };
    let records = match source.read(committed, state.config.poll_batch).await {
        Ok(records) => records,
        Err(err) => {
            tracing::warn!(stream_id, error = %err, "stream read failed");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["stream", "receive"])
                .inc();
            return 0;
        }
    };

    let mut next = committed;
    let mut processed = 0;
    for record in records {
        if record.offset <= next {
            continue;
        }
        match ingest::submit_raw(state, "stream", &record.body).await {
            Disposition::Settle => {
                next = record.offset;
                processed += 1;
            }
            Disposition::Retry => break,
        }
    }

    if next > committed {
        if let Err(err) = state.repo.commit_stream_checkpoint(stream_id, next).await {
            tracing::warn!(stream_id, error = %err, "checkpoint commit failed; records may be re-read");
        }
    }
    processed
}
