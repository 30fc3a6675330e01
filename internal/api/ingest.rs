use crate::api::AppState;
use crate::engine::SubmitError;
use crate::ingest::{self, WireFragment};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

/// The push adapter: producers POST fragments to `/`, players GET `/` for a
/// progress readout.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(submit_fragment).get(message_stats))
        .with_state(state)
}

async fn submit_fragment(
    State(state): State<AppState>,
    Json(wire): Json<WireFragment>,
) -> (StatusCode, String) {
    let result = state.engine.submit(wire.into_fragment()).await;
    ingest::record_submit(&state, "http", &result);
    match result {
        Ok(outcome) => {
            tracing::debug!(outcome = outcome.as_str(), "fragment ingested");
            (StatusCode::OK, "OK".to_string())
        }
        Err(err) => {
            tracing::warn!(error = %err, "fragment submission failed");
            (submit_error_status(&err), err.to_string())
        }
    }
}

fn submit_error_status(err: &SubmitError) -> StatusCode {
    match err {
        SubmitError::InvalidFragment(_) | SubmitError::CorruptMessage(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        SubmitError::StoreUnavailable(_) | SubmitError::IncompleteMessage { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SubmitError::ForwardFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

pub(crate) async fn message_stats(
    State(state): State<AppState>,
) -> Result<String, (StatusCode, String)> {
    match state.engine.tracked_messages().await {
        Ok(count) => Ok(format!("There are {count} messages pending reassembly\n")),
        Err(err) => Err((StatusCode::SERVICE_UNAVAILABLE, err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{router, submit_error_status};
    use crate::engine::SubmitError;
    use crate::test_support;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use std::task::Context;
    use tower::Service;

    async fn call(app: &mut Router, method: &str, body: &str) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri("/");
        if method == "POST" {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder.body(Body::from(body.to_string())).expect("request");
        let waker = futures_util::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let _ = <Router as Service<Request<Body>>>::poll_ready(app, &mut cx);
        let response = <Router as Service<Request<Body>>>::call(app, req)
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    fn wire(id: &str, index: u32, total: u32, data: &str) -> String {
        format!(r#"{{"Id":"{id}","PartNumber":{index},"TotalParts":{total},"Data":"{data}"}}"#)
    }

    #[tokio::test]
    async fn posting_both_parts_returns_ok_and_forwards() {
        let (state, _store, forwarder) = test_support::memory_state();
        let mut app = router(state);

        let (status, body) = call(&mut app, "POST", &wire("m1", 0, 2, "Hel")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");

        let (status, _) = call(&mut app, "POST", &wire("m1", 1, 2, "lo")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(forwarder.sent(), vec![("m1".to_string(), b"Hello".to_vec())]);
    }

    #[tokio::test]
    async fn duplicates_and_late_fragments_still_answer_ok() {
        let (state, _store, forwarder) = test_support::memory_state();
        let mut app = router(state);

        call(&mut app, "POST", &wire("m1", 0, 1, "whole")).await;
        let (status, body) = call(&mut app, "POST", &wire("m1", 0, 1, "whole")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
        assert_eq!(forwarder.sent().len(), 1);
    }

    #[tokio::test]
    async fn malformed_bodies_are_client_errors() {
        let (state, _store, _forwarder) = test_support::memory_state();
        let mut app = router(state);

        let (status, _) = call(&mut app, "POST", "this is not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&mut app, "POST", &wire("m1", 5, 2, "x")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn store_outage_maps_to_service_unavailable() {
        let (state, store, _forwarder) = test_support::memory_state();
        store.set_unavailable(true);
        let mut app = router(state);

        let (status, _) = call(&mut app, "POST", &wire("m1", 0, 2, "Hel")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn failed_forward_maps_to_bad_gateway() {
        let (state, _store) = test_support::memory_state_with_failing_forwarder();
        let mut app = router(state);

        let (status, body) = call(&mut app, "POST", &wire("m1", 0, 1, "whole")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.contains("forward of message m1 failed"));
    }

    #[tokio::test]
    async fn stats_reports_pending_message_count() {
        let (state, _store, _forwarder) = test_support::memory_state();
        let mut app = router(state.clone());

        let (status, body) = call(&mut app, "GET", "").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("There are 0 messages pending reassembly"));

        call(&mut app, "POST", &wire("m1", 0, 2, "Hel")).await;
        let (_, body) = call(&mut app, "GET", "").await;
        assert!(body.contains("There are 1 messages pending reassembly"));
    }

    #[tokio::test]
    async fn stats_surfaces_store_outage() {
        let (state, store, _forwarder) = test_support::memory_state();
        store.set_unavailable(true);
        let mut app = router(state);

        let (status, _) = call(&mut app, "GET", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn error_statuses_follow_the_adapter_contract() {
        assert_eq!(
            submit_error_status(&SubmitError::InvalidFragment("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            submit_error_status(&SubmitError::CorruptMessage("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            submit_error_status(&SubmitError::StoreUnavailable("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            submit_error_status(&SubmitError::IncompleteMessage {
                message_id: "m".into(),
                part_index: 0
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            submit_error_status(&SubmitError::ForwardFailed {
                message_id: "m".into(),
                reason: "sink".into()
            }),
            StatusCode::BAD_GATEWAY
        );
    }
}
