//! At-most-once execution of remote calls over an unreliable transport.
//!
//! A [`RetryClient`] numbers each call, retransmits it until a reply
//! arrives or the policy gives up, and keeps at most one call in flight
//! at a time. On the other side a [`Dispatcher`] reconciles every
//! delivered copy of a request against a per-client [`SessionTable`]:
//! a new call runs the application [`Handler`] exactly once, a duplicate
//! of a running call waits for it, a duplicate of a finished call is
//! answered from the cached reply, and anything older is discarded.
//! Between them the two halves guarantee that a call's side effects
//! happen at most once no matter how often the network drops, delays or
//! duplicates packets.
//!
//! The crate never does I/O of its own. The transport is abstract
//! ([`Transport`]) and receive loops live with the application, which
//! feeds inbound packets to [`Dispatcher::dispatch`] and
//! [`RetryClient::deliver`].

use std::num::NonZeroU32;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod dispatch;
pub mod error;
pub mod session;
#[cfg(feature = "tokio")]
pub mod tokio;
pub mod transport;

pub use client::{RetryClient, RetryLimit, RetryPolicy};
pub use dispatch::{Dispatcher, Handler};
pub use error::{CallError, DispatchError};
pub use session::{Admission, Session, SessionStore, SessionTable};
pub use transport::{MpscTransport, Packet, Transport};

/// Per-client call sequence number. Allocation starts at 1; 0 is the
/// sentinel for "no call has begun".
pub type SeqNo = u64;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(8) {
    Some(n) => n,
    None => unreachable!(),
};
pub const DEFAULT_SESSION_SHARDS: usize = 16;

/// Stable identity of one client. Uniqueness is the caller's
/// responsibility; two live clients sharing an id break the
/// at-most-once guarantee.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Application-level failure produced by a handler. It travels back to
/// the caller unchanged and is cached and deduplicated exactly like a
/// success.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AppError(pub String);

impl AppError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// What a handler produces and what the session table caches.
pub type AppResult<R> = Result<R, AppError>;

/// One remote operation. Immutable once sent; a retransmission is the
/// same value sent again, so a deterministic codec yields identical
/// bytes on the wire.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<Op> {
    pub client: ClientId,
    pub seq: SeqNo,
    pub op: Op,
}

/// The one true result of a call, echoing `(client, seq)` so the
/// receiver can correlate it. Every delivered copy of a request that is
/// answered at all is answered with the same reply.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<R> {
    pub client: ClientId,
    pub seq: SeqNo,
    pub result: AppResult<R>,
}
