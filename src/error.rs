use thiserror::Error;

use crate::{AppError, SeqNo};

/// Terminal outcomes a caller of [`RetryClient::call`] can see, besides
/// a successful reply.
///
/// Everything else the delivery layer runs into (duplicates, stale
/// retransmissions, in-progress waits) is resolved internally and never
/// surfaces here.
///
/// [`RetryClient::call`]: crate::RetryClient::call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No reply after exhausting the configured retries. Whether the
    /// operation executed is genuinely unknown unless it is idempotent.
    #[error("no reply after {attempts} attempts")]
    DeliveryTimeout { attempts: u32 },
    /// The handler ran and failed. This is a delivered result like any
    /// success: it was executed at most once and is cached server-side.
    #[error("application error: {0}")]
    Application(#[from] AppError),
}

/// Reasons the dispatcher refuses an inbound request without replying.
///
/// Neither is fatal and neither reaches the application handler; the
/// serving loop logs and drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A retransmission of a call the client has already moved past.
    /// Safe to discard: the sender has observed a result for a later
    /// call and no longer awaits this reply.
    #[error("stale request {seq}, session already at {last_seq}")]
    Stale { seq: SeqNo, last_seq: SeqNo },
    /// The client skipped ahead of its recorded progress, which a
    /// well-behaved single-flight client cannot do.
    #[error("out-of-order request {seq}, session at {last_seq}")]
    OutOfOrder { seq: SeqNo, last_seq: SeqNo },
}
