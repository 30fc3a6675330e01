use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lapin::options::{BasicAckOptions, BasicGetOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::api::AppState;
use crate::ingest::{self, Disposition};

/// One message pulled from a queue. The receipt settles exactly this
/// delivery; redelivered copies carry fresh receipts.
pub struct QueueDelivery {
    pub receipt: u64,
    pub body: Bytes,
}

/// Pull-based queue. Deliveries stay on the queue until settled, so a crash
/// between receive and settle redelivers them.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn receive(&self, max: usize) -> Result<Vec<QueueDelivery>, String>;
    async fn settle(&self, receipt: u64) -> Result<(), String>;
}

#[derive(Debug)]
pub struct AmqpQueueSource {
    // The connection handle has to outlive the channel.
    _conn: Connection,
    channel: Arc<Mutex<Channel>>,
    queue: String,
}

impl AmqpQueueSource {
    pub async fn connect(url: &str, queue: &str) -> Result<Self, String> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| format!("queue connect failed: {err}"))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|err| format!("queue channel failed: {err}"))?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("queue declare failed: {err}"))?;
        Ok(Self {
            _conn: conn,
            channel: Arc::new(Mutex::new(channel)),
            queue: queue.to_string(),
        })
    }
}

#[async_trait]
impl QueueSource for AmqpQueueSource {
    async fn receive(&self, max: usize) -> Result<Vec<QueueDelivery>, String> {
        let channel = self.channel.lock().await;
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let message = channel
                .basic_get(&self.queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|err| format!("queue receive failed: {err}"))?;
            match message {
                Some(message) => deliveries.push(QueueDelivery {
                    receipt: message.delivery.delivery_tag,
                    body: Bytes::copy_from_slice(&message.delivery.data),
                }),
                None => break,
            }
        }
        Ok(deliveries)
    }

    async fn settle(&self, receipt: u64) -> Result<(), String> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(receipt, BasicAckOptions::default())
            .await
            .map_err(|err| format!("queue ack failed: {err}"))
    }
}

pub fn spawn_queue_ingest(state: AppState, source: Arc<dyn QueueSource>) {
    tokio::spawn(async move {
        loop {
            let processed = queue_ingest_once(&state, source.as_ref()).await;
            if processed == 0 {
                sleep(state.config.poll_idle).await;
            }
        }
    });
}

pub(crate) async fn queue_ingest_once(state: &AppState, source: &dyn QueueSource) -> usize {
    let deliveries = match source.receive(state.config.poll_batch).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            tracing::warn!(error = %err, "queue receive failed");
            state
                .metrics
                .ingest_errors
                .with_label_values(&["queue", "receive"])
                .inc();
            return 0;
        }
    };
    let mut processed = 0;
    for delivery in deliveries {
        processed += 1;
        match ingest::submit_raw(state, "queue", &delivery.body).await {
            Disposition::Settle => {
                if let Err(err) = source.settle(delivery.receipt).await {
                    tracing::warn!(error = %err, "queue ack failed; delivery will reappear");
                }
            }
            Disposition::Retry => {}
        }
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::{queue_ingest_once, AmqpQueueSource};
    use crate::test_support::{self, MemoryQueueSource};

    fn wire(id: &str, index: u32, total: u32, data: &str) -> Vec<u8> {
        format!(
            r#"{{"Id":"{id}","PartNumber":{index},"TotalParts":{total},"Data":"{data}"}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn batch_is_processed_and_settled_after_terminal_outcomes() {
        let (state, _store, forwarder) = test_support::memory_state();
        let source = MemoryQueueSource::new();
        source.push(&wire("m1", 0, 2, "Hel"));
        source.push(&wire("m1", 1, 2, "lo"));

        let processed = queue_ingest_once(&state, &source).await;
        assert_eq!(processed, 2);
        assert_eq!(source.pending(), 0);
        assert_eq!(forwarder.sent(), vec![("m1".to_string(), b"Hello".to_vec())]);
    }

    #[tokio::test]
    async fn transient_failures_leave_deliveries_for_redelivery() {
        let (state, store, forwarder) = test_support::memory_state();
        let source = MemoryQueueSource::new();
        source.push(&wire("m1", 0, 1, "all"));

        store.set_unavailable(true);
        queue_ingest_once(&state, &source).await;
        assert_eq!(source.pending(), 1);
        assert!(forwarder.sent().is_empty());

        store.set_unavailable(false);
        queue_ingest_once(&state, &source).await;
        assert_eq!(source.pending(), 0);
        assert_eq!(forwarder.sent().len(), 1);
    }

    #[tokio::test]
    async fn poison_deliveries_are_settled_without_forwarding() {
        let (state, _store, forwarder) = test_support::memory_state();
        let source = MemoryQueueSource::new();
        source.push(b"{definitely not a fragment");

        let processed = queue_ingest_once(&state, &source).await;
        assert_eq!(processed, 1);
        assert_eq!(source.pending(), 0);
        assert!(forwarder.sent().is_empty());
    }

    #[tokio::test]
    async fn receive_errors_are_counted_and_yield_nothing() {
        let (state, _store, _forwarder) = test_support::memory_state();
        let source = MemoryQueueSource::new();
        source.push(&wire("m1", 0, 1, "x"));
        source.set_fail_receive(true);

        let processed = queue_ingest_once(&state, &source).await;
        assert_eq!(processed, 0);
        assert_eq!(source.pending(), 1);
        let errors = state
            .metrics
            .ingest_errors
            .with_label_values(&["queue", "receive"])
            .get();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn duplicate_redelivery_is_settled_without_a_second_forward() {
        let (state, _store, forwarder) = test_support::memory_state();
        let source = MemoryQueueSource::new();
        source.push(&wire("m1", 0, 1, "all"));
        queue_ingest_once(&state, &source).await;

        // The broker redelivers the same payload under a new receipt.
        source.push(&wire("m1", 0, 1, "all"));
        queue_ingest_once(&state, &source).await;
        assert_eq!(source.pending(), 0);
        assert_eq!(forwarder.sent().len(), 1);
    }

    #[tokio::test]
    async fn amqp_connect_reports_unreachable_broker() {
        let err = AmqpQueueSource::connect("amqp://127.0.0.1:1", "fragments")
            .await
            .expect_err("broker is unreachable");
        assert!(err.contains("queue connect failed"));
    }
}
