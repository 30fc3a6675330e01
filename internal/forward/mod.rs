use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Header carrying the shared sink token, matching what the scoring endpoint
/// expects.
pub const SINK_TOKEN_HEADER: &str = "x-sink-token";

#[derive(Debug)]
pub enum ForwardError {
    Transport(String),
    Status { code: u16 },
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(reason) => write!(f, "sink unreachable: {reason}"),
            Self::Status { code } => write!(f, "sink answered status {code}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Outbound delivery of an assembled message. Fallible and non-idempotent
/// from the engine's point of view; the engine never retries it.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, message_id: &str, payload: &[u8]) -> Result<(), ForwardError>;
}

/// Posts assembled messages to the scoring sink: `POST {sink_url}/{id}` with
/// the payload as the body and the shared token in a header.
pub struct HttpForwarder {
    client: reqwest::Client,
    sink_url: String,
    token: String,
}

impl HttpForwarder {
    pub fn new(sink_url: &str, token: &str, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("sink client build failed: {err}"))?;
        Ok(Self {
            client,
            sink_url: sink_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, message_id: &str, payload: &[u8]) -> Result<(), ForwardError> {
        let url = format!("{}/{}", self.sink_url, message_id);
        let response = self
            .client
            .post(&url)
            .header(SINK_TOKEN_HEADER, &self.token)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|err| ForwardError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                code: status.as_u16(),
            });
        }
        tracing::debug!(message_id, status = status.as_u16(), "sink accepted message");
        Ok(())
    }
}
