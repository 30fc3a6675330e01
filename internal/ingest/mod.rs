use bytes::Bytes;
use serde::Deserialize;

use crate::api::AppState;
use crate::engine::{Fragment, SubmitError, SubmitOutcome};

pub mod object_events;
pub mod queue;
pub mod stream;

/// Wire shape produced by every fragment source.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireFragment {
    pub id: String,
    pub part_number: u32,
    pub total_parts: u32,
    pub data: String,
}

impl WireFragment {
    pub fn into_fragment(self) -> Fragment {
        Fragment {
            message_id: self.id,
            part_index: self.part_number,
            total_parts: self.total_parts,
            payload: Bytes::from(self.data.into_bytes()),
        }
    }
}

pub fn decode_fragment(body: &[u8]) -> Result<Fragment, String> {
    let wire: WireFragment =
        serde_json::from_slice(body).map_err(|err| format!("undecodable fragment: {err}"))?;
    Ok(wire.into_fragment())
}

/// What an adapter should do with the delivery that carried a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The outcome is terminal; acknowledge, delete or advance past it.
    Settle,
    /// Leave the delivery in place so the channel redelivers it.
    Retry,
}

pub fn disposition(result: &Result<SubmitOutcome, SubmitError>) -> Disposition {
    match result {
        Ok(_) => Disposition::Settle,
        Err(err) if err.is_retryable() => Disposition::Retry,
        Err(_) => Disposition::Settle,
    }
}

pub(crate) fn record_submit(
    state: &AppState,
    source: &'static str,
    result: &Result<SubmitOutcome, SubmitError>,
) {
    match result {
        Ok(outcome) => {
            state
                .metrics
                .fragments
                .with_label_values(&[source, outcome.as_str()])
                .inc();
            if matches!(outcome, SubmitOutcome::Forwarded) {
                state.metrics.forwards.with_label_values(&["ok"]).inc();
            }
        }
        Err(err) => {
            state
                .metrics
                .ingest_errors
                .with_label_values(&[source, err.kind()])
                .inc();
            if matches!(err, SubmitError::ForwardFailed { .. }) {
                state.metrics.forwards.with_label_values(&["error"]).inc();
            }
        }
    }
}

/// Decodes and submits one raw fragment body, returning how the carrying
/// delivery should be settled.
pub(crate) async fn submit_raw(state: &AppState, source: &'static str, body: &[u8]) -> Disposition {
    let fragment = match decode_fragment(body) {
        Ok(fragment) => fragment,
        Err(err) => {
            tracing::warn!(source, error = %err, "dropping undecodable fragment");
            state
                .metrics
                .ingest_errors
                .with_label_values(&[source, "decode"])
                .inc();
            return Disposition::Settle;
        }
    };
    let result = state.engine.submit(fragment).await;
    record_submit(state, source, &result);
    match &result {
        Ok(_) => {}
        Err(err) if err.is_retryable() => {
            tracing::warn!(source, error = %err, "submission failed; waiting for redelivery");
        }
        Err(err) => {
            tracing::error!(source, error = %err, "fragment dropped");
        }
    }
    disposition(&result)
}
