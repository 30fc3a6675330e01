use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::forward::Forwarder;

/// One numbered piece of a logical message, as decoded by an ingestion
/// adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub message_id: String,
    pub part_index: u32,
    pub total_parts: u32,
    pub payload: Bytes,
}

impl Fragment {
    fn validate(&self) -> Result<(), SubmitError> {
        if self.message_id.is_empty() {
            return Err(SubmitError::InvalidFragment(
                "fragment has an empty message id".into(),
            ));
        }
        if self.total_parts == 0 {
            return Err(SubmitError::InvalidFragment(format!(
                "message {} declares zero total parts",
                self.message_id
            )));
        }
        if self.part_index >= self.total_parts {
            return Err(SubmitError::InvalidFragment(format!(
                "message {} part {} is out of range for {} total parts",
                self.message_id, self.part_index, self.total_parts
            )));
        }
        Ok(())
    }
}

/// Distinct-part count for a message plus the range of `total_parts` values
/// recorded across its stored fragments. The range collapses to a single
/// value for a healthy message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartTally {
    pub stored: u64,
    pub total_parts_min: u32,
    pub total_parts_max: u32,
}

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
    MissingPart {
        message_id: String,
        part_index: u32,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "store unavailable: {reason}"),
            Self::MissingPart {
                message_id,
                part_index,
            } => write!(f, "message {message_id} is missing part {part_index}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable keyed storage with atomic create-if-absent writes. The only
/// shared mutable state in the system; all cross-worker coordination goes
/// through its conditional writes.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Create-if-absent for one part. `false` means the key already existed.
    async fn try_put_part(&self, fragment: &Fragment) -> Result<bool, StoreError>;

    /// Tally of stored parts for the id; `None` when no part has been stored.
    /// Must reflect every prior successful `try_put_part`.
    async fn count_parts(&self, message_id: &str) -> Result<Option<PartTally>, StoreError>;

    /// Payloads for indexes `0..total_parts` in ascending order.
    async fn get_all_parts(
        &self,
        message_id: &str,
        total_parts: u32,
    ) -> Result<Vec<Bytes>, StoreError>;

    /// Create-if-absent on the completion record. `true` makes the caller
    /// responsible for forwarding.
    async fn try_mark_complete(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Removes the completion record, releasing a claim that could not be
    /// carried through.
    async fn clear_complete(&self, message_id: &str) -> Result<(), StoreError>;

    async fn is_complete(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Number of message ids with at least one stored part and no completion
    /// record.
    async fn open_messages(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// This submission completed the message and delivered it to the sink.
    Forwarded,
    /// The fragment was stored; the message is still incomplete, or another
    /// concurrent submission owns the forward.
    Accepted,
    /// The part (or the whole message) was already recorded; nothing written.
    DuplicateIgnored,
}

impl SubmitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Accepted => "accepted",
            Self::DuplicateIgnored => "duplicate",
        }
    }
}

#[derive(Debug)]
pub enum SubmitError {
    InvalidFragment(String),
    StoreUnavailable(String),
    IncompleteMessage {
        message_id: String,
        part_index: u32,
    },
    CorruptMessage(String),
    ForwardFailed {
        message_id: String,
        reason: String,
    },
}

impl SubmitError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFragment(_) => "invalid",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::IncompleteMessage { .. } => "incomplete",
            Self::CorruptMessage(_) => "corrupt",
            Self::ForwardFailed { .. } => "forward_failed",
        }
    }

    /// Whether the delivery that carried this fragment should be redelivered.
    /// Invalid and corrupt fragments never heal on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::IncompleteMessage { .. } | Self::ForwardFailed { .. }
        )
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFragment(reason) => write!(f, "invalid fragment: {reason}"),
            Self::StoreUnavailable(reason) => write!(f, "fragment store unavailable: {reason}"),
            Self::IncompleteMessage {
                message_id,
                part_index,
            } => write!(
                f,
                "message {message_id} was missing part {part_index} at assembly time"
            ),
            Self::CorruptMessage(reason) => write!(f, "corrupt message: {reason}"),
            Self::ForwardFailed { message_id, reason } => {
                write!(f, "forward of message {message_id} failed: {reason}")
            }
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            StoreError::MissingPart {
                message_id,
                part_index,
            } => Self::IncompleteMessage {
                message_id,
                part_index,
            },
        }
    }
}

/// Accepts fragments one at a time, persists them idempotently, and forwards
/// each assembled message exactly once. Stateless apart from the store; any
/// number of engines across processes may submit fragments for the same
/// message concurrently.
pub struct ReassemblyEngine {
    store: Arc<dyn FragmentStore>,
    forwarder: Arc<dyn Forwarder>,
}

impl ReassemblyEngine {
    pub fn new(store: Arc<dyn FragmentStore>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self { store, forwarder }
    }

    pub async fn submit(&self, fragment: Fragment) -> Result<SubmitOutcome, SubmitError> {
        fragment.validate()?;

        if self.store.is_complete(&fragment.message_id).await? {
            tracing::debug!(
                message_id = %fragment.message_id,
                part = fragment.part_index,
                "fragment arrived after completion"
            );
            return Ok(SubmitOutcome::DuplicateIgnored);
        }

        let inserted = self.store.try_put_part(&fragment).await?;
        if !inserted {
            tracing::debug!(
                message_id = %fragment.message_id,
                part = fragment.part_index,
                "duplicate fragment"
            );
        }
        // A duplicate still drives the completion check: when an assembly
        // attempt aborted and released its claim, the redelivered fragment
        // that retries it is necessarily a duplicate.
        let settled = if inserted {
            SubmitOutcome::Accepted
        } else {
            SubmitOutcome::DuplicateIgnored
        };

        let tally = match self.store.count_parts(&fragment.message_id).await? {
            Some(tally) => tally,
            None => {
                return Err(SubmitError::StoreUnavailable(format!(
                    "no parts visible for message {} after insert",
                    fragment.message_id
                )))
            }
        };
        check_tally(&fragment, &tally)?;

        if tally.stored < u64::from(fragment.total_parts) {
            return Ok(settled);
        }

        if !self.store.try_mark_complete(&fragment.message_id).await? {
            // Lost the completion race; the winner forwards.
            return Ok(settled);
        }

        self.assemble_and_forward(&fragment).await
    }

    /// Messages with at least one stored part that have not completed.
    pub async fn tracked_messages(&self) -> Result<u64, SubmitError> {
        Ok(self.store.open_messages().await?)
    }

    async fn assemble_and_forward(
        &self,
        fragment: &Fragment,
    ) -> Result<SubmitOutcome, SubmitError> {
        let parts = match self
            .store
            .get_all_parts(&fragment.message_id, fragment.total_parts)
            .await
        {
            Ok(parts) => parts,
            Err(StoreError::MissingPart {
                message_id,
                part_index,
            }) => {
                return self.abort_claim(message_id, part_index).await;
            }
            Err(err) => return Err(err.into()),
        };

        let assembled = assemble(&parts);
        if let Err(err) = self.forwarder.forward(&fragment.message_id, &assembled).await {
            tracing::error!(
                message_id = %fragment.message_id,
                error = %err,
                "forward failed after completion was claimed; redelivery cannot recover this message"
            );
            return Err(SubmitError::ForwardFailed {
                message_id: fragment.message_id.clone(),
                reason: err.to_string(),
            });
        }

        tracing::info!(
            message_id = %fragment.message_id,
            parts = fragment.total_parts,
            bytes = assembled.len(),
            "message forwarded"
        );
        Ok(SubmitOutcome::Forwarded)
    }

    /// Releases a completion claim whose parts could not all be read, so a
    /// later submission can retry completion.
    async fn abort_claim(
        &self,
        message_id: String,
        part_index: u32,
    ) -> Result<SubmitOutcome, SubmitError> {
        if let Err(err) = self.store.clear_complete(&message_id).await {
            tracing::error!(
                message_id = %message_id,
                error = %err,
                "failed to release completion claim; message may be stuck marked complete"
            );
            return Err(err.into());
        }
        Err(SubmitError::IncompleteMessage {
            message_id,
            part_index,
        })
    }
}

fn check_tally(fragment: &Fragment, tally: &PartTally) -> Result<(), SubmitError> {
    if tally.total_parts_min != tally.total_parts_max
        || tally.total_parts_max != fragment.total_parts
    {
        return Err(SubmitError::CorruptMessage(format!(
            "message {} has disagreeing total_parts: stored {}..{}, fragment says {}",
            fragment.message_id, tally.total_parts_min, tally.total_parts_max, fragment.total_parts
        )));
    }
    if tally.stored > u64::from(fragment.total_parts) {
        return Err(SubmitError::CorruptMessage(format!(
            "message {} has {} parts stored but only {} expected",
            fragment.message_id, tally.stored, fragment.total_parts
        )));
    }
    Ok(())
}

fn assemble(parts: &[Bytes]) -> Vec<u8> {
    let total: usize = parts.iter().map(Bytes::len).sum();
    let mut assembled = Vec::with_capacity(total);
    for part in parts {
        assembled.extend_from_slice(part);
    }
    assembled
}
