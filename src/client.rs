//! Client side: number each call, retransmit until a reply arrives or
//! the policy gives up, and keep at most one call in flight.

use std::num::NonZeroU32;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::transport::Transport;
use crate::{
    AppResult, CallError, ClientId, Reply, Request, SeqNo, DEFAULT_RETRY_ATTEMPTS,
    DEFAULT_RETRY_INTERVAL,
};

/// How long a call keeps retransmitting before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up with [`CallError::DeliveryTimeout`] after this many
    /// sends.
    Attempts(NonZeroU32),
    /// Retransmit forever. Only appropriate for idempotent operations
    /// or callers prepared to block indefinitely.
    Unbounded,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How long each attempt waits for a reply before the request is
    /// sent again.
    pub interval: Duration,
    pub limit: RetryLimit,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { interval: DEFAULT_RETRY_INTERVAL, limit: RetryLimit::Attempts(DEFAULT_RETRY_ATTEMPTS) }
    }
}

/// Client half of the delivery layer.
///
/// `call` blocks until the call terminates: either the one true reply
/// came back (possibly after several retransmissions of the identical
/// request) or the policy ran out. Replies are fed in from the owner's
/// receive loop via [`RetryClient::deliver`].
pub struct RetryClient<T: Transport> {
    id: ClientId,
    transport: T,
    policy: RetryPolicy,
    /// Held across a whole call. One call in flight per client is what
    /// lets the server track progress with a single `last_seq` scalar.
    flight: Mutex<()>,
    inner: Mutex<Inner<T::Ret>>,
    reply_ready: Condvar,
}

struct Inner<R> {
    next_seq: SeqNo,
    in_flight: Option<SeqNo>,
    slot: Option<AppResult<R>>,
}

impl<T: Transport> RetryClient<T> {
    pub fn new(id: ClientId, transport: T) -> Self {
        Self::with_policy(id, transport, RetryPolicy::default())
    }

    pub fn with_policy(id: ClientId, transport: T, policy: RetryPolicy) -> Self {
        Self {
            id,
            transport,
            policy,
            flight: Mutex::new(()),
            inner: Mutex::new(Inner { next_seq: 1, in_flight: None, slot: None }),
            reply_ready: Condvar::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Issue one remote call and block until it terminates.
    ///
    /// Giving up is client-local: the server may still execute the
    /// call, and a later retransmission would be answered from its
    /// cache. The abandoned sequence number is never reused.
    pub fn call(&self, op: T::Op) -> Result<T::Ret, CallError> {
        let _flight = self.flight.lock().unwrap();
        let seq = {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.in_flight = Some(seq);
            inner.slot = None;
            seq
        };
        // Retransmissions re-send this exact value.
        let request = Request { client: self.id, seq, op };
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            if attempts > 1 {
                debug!(client = %self.id, seq, attempt = attempts, "retransmitting");
            }
            self.transport.send_request(&request);

            let inner = self.inner.lock().unwrap();
            let (mut inner, _timed_out) = self
                .reply_ready
                .wait_timeout_while(inner, self.policy.interval, |inner| inner.slot.is_none())
                .unwrap();
            if let Some(result) = inner.slot.take() {
                inner.in_flight = None;
                break result;
            }
            if let RetryLimit::Attempts(max) = self.policy.limit {
                if attempts >= max.get() {
                    inner.in_flight = None;
                    warn!(client = %self.id, seq, attempts, "giving up on call");
                    return Err(CallError::DeliveryTimeout { attempts });
                }
            }
        };
        result.map_err(CallError::Application)
    }

    /// Feed one reply in from the owner's receive loop.
    ///
    /// A reply that does not match the call currently in flight is
    /// dropped: it answers a call this client has already given up on
    /// or completed.
    pub fn deliver(&self, reply: Reply<T::Ret>) {
        let mut inner = self.inner.lock().unwrap();
        if reply.client == self.id && inner.in_flight == Some(reply.seq) {
            inner.slot = Some(reply.result);
            drop(inner);
            self.reply_ready.notify_one();
        } else {
            trace!(client = %self.id, seq = reply.seq, "dropping late reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::dispatch::{Dispatcher, Handler};
    use crate::transport::{MpscTransport, Packet};
    use crate::AppError;

    struct Echo {
        hits: AtomicUsize,
        delay: Duration,
    }

    impl Echo {
        fn new(delay: Duration) -> Self {
            Self { hits: AtomicUsize::new(0), delay }
        }
    }

    impl Handler for Echo {
        type Op = String;
        type Ret = String;

        fn execute(&self, _client: ClientId, op: String) -> AppResult<String> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if op == "boom" {
                return Err(AppError::new("boom"));
            }
            Ok(format!("ok:{op}"))
        }
    }

    type Client = RetryClient<MpscTransport<String, String>>;

    struct Harness {
        client: Arc<Client>,
        dispatcher: Arc<Dispatcher<Echo>>,
    }

    /// Wire a client and a dispatcher together over two in-process
    /// links. `drop_requests` swallows that many inbound requests
    /// before the server starts answering.
    fn harness(policy: RetryPolicy, delay: Duration, drop_requests: usize) -> Harness {
        let (to_server, server_rx) = MpscTransport::new();
        let (to_client, client_rx) = MpscTransport::<String, String>::new();
        let dispatcher = Arc::new(Dispatcher::new(Echo::new(delay)));
        let client = Arc::new(Client::with_policy(ClientId::new(1), to_server, policy));

        // The pump threads detach; they exit when their channel closes.
        {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                let mut remaining_drops = drop_requests;
                for packet in server_rx {
                    if let Packet::Request(request) = packet {
                        if remaining_drops > 0 {
                            remaining_drops -= 1;
                            continue;
                        }
                        if let Ok(reply) = dispatcher.dispatch(request) {
                            to_client.send_reply(&reply);
                        }
                    }
                }
            });
        }
        {
            let client = client.clone();
            thread::spawn(move || {
                for packet in client_rx {
                    if let Packet::Reply(reply) = packet {
                        client.deliver(reply);
                    }
                }
            });
        }
        Harness { client, dispatcher }
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(10),
            limit: RetryLimit::Attempts(NonZeroU32::new(attempts).unwrap()),
        }
    }

    #[test]
    fn call_round_trip() {
        let h = harness(fast_policy(8), Duration::ZERO, 0);
        assert_eq!(h.client.call("hello".to_string()), Ok("ok:hello".to_string()));
        assert_eq!(h.client.call("again".to_string()), Ok("ok:again".to_string()));
        assert_eq!(h.dispatcher.handler().hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retries_until_a_send_gets_through() {
        let h = harness(fast_policy(10), Duration::ZERO, 2);
        assert_eq!(h.client.call("hello".to_string()), Ok("ok:hello".to_string()));
        assert_eq!(h.dispatcher.handler().hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gives_up_after_configured_attempts() {
        // No server at all: the receiver half is dropped immediately.
        let (to_server, _) = MpscTransport::<String, String>::new();
        let client = Client::with_policy(ClientId::new(1), to_server, fast_policy(3));
        let start = Instant::now();
        assert_eq!(
            client.call("hello".to_string()),
            Err(CallError::DeliveryTimeout { attempts: 3 })
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn unsolicited_reply_is_dropped() {
        let h = harness(fast_policy(8), Duration::ZERO, 0);
        h.client.deliver(Reply {
            client: ClientId::new(1),
            seq: 99,
            result: Ok("stray".to_string()),
        });
        // The stray must not satisfy the next call.
        assert_eq!(h.client.call("hello".to_string()), Ok("ok:hello".to_string()));
    }

    #[test]
    fn application_error_reaches_the_caller() {
        let h = harness(fast_policy(8), Duration::ZERO, 0);
        assert_eq!(
            h.client.call("boom".to_string()),
            Err(CallError::Application(AppError::new("boom")))
        );
        // Terminal like any success: the next call proceeds normally.
        assert_eq!(h.client.call("hello".to_string()), Ok("ok:hello".to_string()));
    }

    #[test]
    fn one_call_in_flight_per_client() {
        let h = harness(fast_policy(32), Duration::from_millis(30), 0);
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        let mut workers = Vec::new();
        for op in ["a", "b"] {
            let client = h.client.clone();
            let arrivals = arrivals.clone();
            workers.push(thread::spawn(move || {
                let reply = client.call(op.to_string()).unwrap();
                arrivals.lock().unwrap().push(reply);
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        // Both calls completed, sequentially: the handler saw exactly
        // two executions and the session advanced to seq 2.
        assert_eq!(arrivals.lock().unwrap().len(), 2);
        assert_eq!(h.dispatcher.handler().hits.load(Ordering::SeqCst), 2);
        assert_eq!(h.dispatcher.sessions().len(), 1);
    }
}
