//! Async variants of the client and dispatcher on the tokio stack.
//!
//! Same decision logic as the sync modules; only the suspension
//! primitives differ. A duplicate of an in-progress call parks on a
//! per-session `Notify`, and the retry client awaits its reply slot
//! under `tokio::time::timeout`.

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex};

use ::tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use ::tokio::sync::{oneshot, Notify};
use ::tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::session::{Admission, SessionState};
use crate::transport::{Packet, Transport};
use crate::{
    AppError, AppResult, CallError, ClientId, DispatchError, Reply, Request, RetryLimit,
    RetryPolicy, SeqNo, DEFAULT_SESSION_SHARDS,
};

/// Async twin of [`crate::Handler`]; still invoked at most once per
/// accepted call, under the calling client's exclusion scope only.
pub trait AsyncHandler: Send + Sync + 'static {
    type Op: Send;
    type Ret: Clone + Send;

    fn execute(
        &self,
        client: ClientId,
        op: Self::Op,
    ) -> impl Future<Output = AppResult<Self::Ret>> + Send;
}

struct TokioSession<R> {
    state: Mutex<SessionState<R>>,
    completed: Notify,
}

fn finish<R: Clone>(session: &TokioSession<R>, seq: SeqNo, result: AppResult<R>) {
    session.state.lock().unwrap().finish(seq, result);
    session.completed.notify_waiters();
}

/// A cancelled or panicking execution must still release its waiters,
/// or every retransmission of the call would park forever.
struct FinishOnDrop<'a, R: Clone> {
    session: &'a TokioSession<R>,
    seq: SeqNo,
}

impl<R: Clone> Drop for FinishOnDrop<'_, R> {
    fn drop(&mut self) {
        finish(self.session, self.seq, Err(AppError::new("execution aborted")));
    }
}

/// Async twin of [`crate::Dispatcher`], same decision table.
pub struct TokioDispatcher<H: AsyncHandler> {
    handler: H,
    shards: Box<[Mutex<HashMap<ClientId, Arc<TokioSession<H::Ret>>>>]>,
}

impl<H: AsyncHandler> TokioDispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            shards: (0..DEFAULT_SESSION_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn session(&self, client: ClientId) -> Arc<TokioSession<H::Ret>> {
        let mut shard =
            self.shards[client.as_u64() as usize % self.shards.len()].lock().unwrap();
        shard
            .entry(client)
            .or_insert_with(|| {
                Arc::new(TokioSession { state: Mutex::new(SessionState::new()), completed: Notify::new() })
            })
            .clone()
    }

    /// Handle one inbound request. `Err` means the packet was dropped
    /// and no reply is owed.
    pub async fn dispatch(&self, request: Request<H::Op>) -> Result<Reply<H::Ret>, DispatchError> {
        let Request { client, seq, op } = request;
        let session = self.session(client);
        let mut op = Some(op);
        loop {
            let verdict = session.state.lock().unwrap().admit(seq);
            match verdict {
                Admission::Execute => {
                    let guard = FinishOnDrop { session: &session, seq };
                    let result = self.handler.execute(client, op.take().unwrap()).await;
                    mem::forget(guard);
                    finish(&session, seq, result.clone());
                    return Ok(Reply { client, seq, result });
                }
                Admission::Wait => {
                    trace!(client = %client, seq, "duplicate of in-progress call, waiting");
                    let notified = session.completed.notified();
                    ::tokio::pin!(notified);
                    // Register before re-checking so a completion landing
                    // in between is not missed.
                    notified.as_mut().enable();
                    if session.state.lock().unwrap().is_executing() {
                        notified.await;
                    }
                }
                Admission::Replay(result) => {
                    debug!(client = %client, seq, "replaying cached reply");
                    return Ok(Reply { client, seq, result });
                }
                Admission::Stale { last_seq } => {
                    trace!(client = %client, seq, last_seq, "discarding stale request");
                    return Err(DispatchError::Stale { seq, last_seq });
                }
                Admission::OutOfOrder { last_seq } => {
                    warn!(client = %client, seq, last_seq, "rejecting out-of-order request");
                    return Err(DispatchError::OutOfOrder { seq, last_seq });
                }
            }
        }
    }
}

/// Async twin of [`crate::RetryClient`]. One call in flight per client.
pub struct TokioRetryClient<T: Transport> {
    id: ClientId,
    transport: T,
    policy: RetryPolicy,
    flight: ::tokio::sync::Mutex<()>,
    inner: Mutex<Inner<T::Ret>>,
}

struct Inner<R> {
    next_seq: SeqNo,
    in_flight: Option<(SeqNo, oneshot::Sender<AppResult<R>>)>,
}

impl<T: Transport> TokioRetryClient<T> {
    pub fn new(id: ClientId, transport: T) -> Self {
        Self::with_policy(id, transport, RetryPolicy::default())
    }

    pub fn with_policy(id: ClientId, transport: T, policy: RetryPolicy) -> Self {
        Self {
            id,
            transport,
            policy,
            flight: ::tokio::sync::Mutex::new(()),
            inner: Mutex::new(Inner { next_seq: 1, in_flight: None }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Issue one remote call and await its terminal result.
    pub async fn call(&self, op: T::Op) -> Result<T::Ret, CallError> {
        let _flight = self.flight.lock().await;
        let (seq, mut rx) = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            inner.in_flight = Some((seq, tx));
            (seq, rx)
        };
        // Retransmissions re-send this exact value.
        let request = Request { client: self.id, seq, op };
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > 1 {
                debug!(client = %self.id, seq, attempt = attempts, "retransmitting");
            }
            self.transport.send_request(&request);
            match timeout(self.policy.interval, &mut rx).await {
                Ok(Ok(result)) => return result.map_err(CallError::Application),
                // The slot only closes if the call record was torn down;
                // report it like any other delivery failure.
                Ok(Err(_)) => return Err(CallError::DeliveryTimeout { attempts }),
                Err(_elapsed) => {
                    if let RetryLimit::Attempts(max) = self.policy.limit {
                        if attempts >= max.get() {
                            self.inner.lock().unwrap().in_flight = None;
                            warn!(client = %self.id, seq, attempts, "giving up on call");
                            return Err(CallError::DeliveryTimeout { attempts });
                        }
                    }
                }
            }
        }
    }

    /// Feed one reply in from the owner's receive loop. A reply that
    /// does not match the call currently in flight is dropped.
    pub fn deliver(&self, reply: Reply<T::Ret>) {
        let mut inner = self.inner.lock().unwrap();
        let expected =
            reply.client == self.id && matches!(&inner.in_flight, Some((seq, _)) if *seq == reply.seq);
        if expected {
            if let Some((_, tx)) = inner.in_flight.take() {
                let _ = tx.send(reply.result);
            }
        } else {
            trace!(client = %self.id, seq = reply.seq, "dropping late reply");
        }
    }
}

/// In-process transport over a tokio unbounded channel, for demos and
/// tests on the async stack.
#[derive(Clone)]
pub struct TokioMpscTransport<Op, R> {
    channel: UnboundedSender<Packet<Op, R>>,
}

impl<Op, R> TokioMpscTransport<Op, R> {
    pub fn new() -> (Self, UnboundedReceiver<Packet<Op, R>>) {
        let (send, recv) = unbounded_channel();
        (Self { channel: send }, recv)
    }
}

impl<Op: Clone, R: Clone> Transport for TokioMpscTransport<Op, R> {
    type Op = Op;
    type Ret = R;

    fn send_request(&self, request: &Request<Op>) {
        let _ = self.channel.send(Packet::Request(request.clone()));
    }

    fn send_reply(&self, reply: &Reply<R>) {
        let _ = self.channel.send(Packet::Reply(reply.clone()));
    }
}
