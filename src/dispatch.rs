//! Server side: reconcile every delivered copy of a request against the
//! session table and invoke the application handler at most once per
//! logical call.

use std::mem;

use tracing::{debug, trace, warn};

use crate::session::{Admission, Session, SessionTable};
use crate::{AppError, AppResult, ClientId, DispatchError, Reply, Request, SeqNo};

/// The application side of the boundary.
///
/// Invoked synchronously by the dispatcher, at most once per accepted
/// call, under the calling client's exclusion scope only; calls from
/// distinct clients may execute concurrently. Whatever shared state the
/// handler mutates must carry its own discipline for that.
pub trait Handler: Send + Sync {
    type Op;
    type Ret: Clone;

    fn execute(&self, client: ClientId, op: Self::Op) -> AppResult<Self::Ret>;
}

/// Server-side entry point of the delivery layer.
///
/// `dispatch` is called once per inbound message, retransmissions
/// included, from whatever threads the serving loop runs. Requests for
/// different clients proceed independently; only requests sharing a
/// client serialize against each other.
pub struct Dispatcher<H: Handler> {
    handler: H,
    sessions: SessionTable<H::Ret>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler, sessions: SessionTable::new() }
    }

    /// Use a prepared table, e.g. one restored from a
    /// [`SessionStore`](crate::SessionStore) or with a custom shard
    /// count.
    pub fn with_sessions(handler: H, sessions: SessionTable<H::Ret>) -> Self {
        Self { handler, sessions }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn sessions(&self) -> &SessionTable<H::Ret> {
        &self.sessions
    }

    /// Handle one inbound request. `Err` means the packet was dropped
    /// and no reply is owed; every `Ok` for a given `(client, seq)`
    /// carries the same reply.
    pub fn dispatch(&self, request: Request<H::Op>) -> Result<Reply<H::Ret>, DispatchError> {
        let Request { client, seq, op } = request;
        let session = self.sessions.session(client);
        let mut op = Some(op);
        loop {
            match session.admit(seq) {
                Admission::Execute => {
                    let result = self.run(&session, client, seq, op.take().unwrap());
                    return Ok(Reply { client, seq, result });
                }
                Admission::Wait => {
                    trace!(client = %client, seq, "duplicate of in-progress call, waiting");
                    session.await_idle();
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

    fn run(
        &self,
        session: &Session<H::Ret>,
        client: ClientId,
        seq: SeqNo,
        op: H::Op,
    ) -> AppResult<H::Ret> {
        let guard = CompleteOnPanic { session, seq };
        let result = self.handler.execute(client, op);
        mem::forget(guard);
        session.complete(seq, result.clone());
        result
    }
}

/// If the handler unwinds, the session must not stay executing forever:
/// waiters would block and every retransmission would dead-end. Publish
/// an application error instead and let the panic propagate to the
/// serving thread.
struct CompleteOnPanic<'a, R: Clone> {
    session: &'a Session<R>,
    seq: SeqNo,
}

impl<R: Clone> Drop for CompleteOnPanic<'_, R> {
    fn drop(&mut self) {
        self.session.complete(self.seq, Err(AppError::new("handler panicked")));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    struct AppendStore {
        map: Mutex<HashMap<String, String>>,
        hits: AtomicUsize,
        delay: Duration,
    }

    impl AppendStore {
        fn new(delay: Duration) -> Self {
            Self { map: Mutex::new(HashMap::new()), hits: AtomicUsize::new(0), delay }
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        fn value(&self, key: &str) -> Option<String> {
            self.map.lock().unwrap().get(key).cloned()
        }
    }

    impl Handler for AppendStore {
        type Op = (String, String);
        type Ret = String;

        fn execute(&self, _client: ClientId, (key, val): (String, String)) -> AppResult<String> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if val == "boom" {
                return Err(AppError::new("boom"));
            }
            if val == "panic" {
                panic!("handler blew up");
            }
            let mut map = self.map.lock().unwrap();
            let entry = map.entry(key).or_default();
            entry.push_str(&val);
            Ok(entry.clone())
        }
    }

    fn dispatcher(delay: Duration) -> Arc<Dispatcher<AppendStore>> {
        Arc::new(Dispatcher::new(AppendStore::new(delay)))
    }

    fn request(client: u64, seq: SeqNo, key: &str, val: &str) -> Request<(String, String)> {
        Request { client: ClientId::new(client), seq, op: (key.to_string(), val.to_string()) }
    }

    #[test]
    fn retransmissions_execute_once() {
        let d = dispatcher(Duration::ZERO);
        let req = request(1, 1, "x", "a");
        let first = d.dispatch(req.clone()).unwrap();
        assert_eq!(first.result, Ok("a".to_string()));
        // The ack was lost; three identical retries all converge on the
        // cached reply and the value stays "a", not "aaaa".
        for _ in 0..3 {
            let retry = d.dispatch(req.clone()).unwrap();
            assert_eq!(retry, first);
        }
        assert_eq!(d.handler().value("x"), Some("a".to_string()));
        assert_eq!(d.handler().hits(), 1);
    }

    #[test]
    fn concurrent_duplicate_waits_for_single_execution() {
        let d = dispatcher(Duration::from_millis(50));
        let req = request(1, 1, "x", "a");
        let original = {
            let d = d.clone();
            let req = req.clone();
            thread::spawn(move || d.dispatch(req).unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        let duplicate = d.dispatch(req).unwrap();
        let original = original.join().unwrap();
        assert_eq!(duplicate, original);
        assert_eq!(d.handler().hits(), 1);
    }

    #[test]
    fn superseded_duplicate_is_discarded() {
        let d = dispatcher(Duration::ZERO);
        d.dispatch(request(1, 1, "x", "a")).unwrap();
        d.dispatch(request(1, 2, "x", "b")).unwrap();
        let stray = d.dispatch(request(1, 1, "x", "a"));
        assert_eq!(stray, Err(DispatchError::Stale { seq: 1, last_seq: 2 }));
        assert_eq!(d.handler().value("x"), Some("ab".to_string()));
        assert_eq!(d.handler().hits(), 2);
    }

    #[test]
    fn distinct_clients_run_concurrently() {
        let d = dispatcher(Duration::from_millis(100));
        let start = Instant::now();
        let other = {
            let d = d.clone();
            thread::spawn(move || d.dispatch(request(2, 1, "y", "b")).unwrap())
        };
        d.dispatch(request(1, 1, "x", "a")).unwrap();
        other.join().unwrap();
        // Both handlers sleep 100ms; serialized they would need 200ms.
        assert!(start.elapsed() < Duration::from_millis(190));
        assert_eq!(d.handler().hits(), 2);
    }

    #[test]
    fn next_call_serializes_behind_running_one() {
        let d = dispatcher(Duration::from_millis(50));
        let first = {
            let d = d.clone();
            thread::spawn(move || d.dispatch(request(1, 1, "x", "a")).unwrap())
        };
        thread::sleep(Duration::from_millis(10));
        // The client abandoned seq 1 and moved on; its new call must not
        // overlap the execution still running for seq 1.
        let second = d.dispatch(request(1, 2, "x", "b")).unwrap();
        assert_eq!(second.result, Ok("ab".to_string()));
        first.join().unwrap();
        assert_eq!(d.handler().hits(), 2);
    }

    #[test]
    fn known_session_cannot_skip_ahead() {
        let d = dispatcher(Duration::ZERO);
        d.dispatch(request(1, 1, "x", "a")).unwrap();
        let skipped = d.dispatch(request(1, 5, "x", "b"));
        assert_eq!(skipped, Err(DispatchError::OutOfOrder { seq: 5, last_seq: 1 }));
        assert_eq!(d.handler().hits(), 1);
    }

    #[test]
    fn first_contact_adopts_client_progress() {
        let d = dispatcher(Duration::ZERO);
        // An evicted (or restarted-table) client resumes mid-sequence;
        // its first contact is accepted as a fresh call.
        let reply = d.dispatch(request(9, 7, "x", "a")).unwrap();
        assert_eq!(reply.result, Ok("a".to_string()));
        assert_eq!(d.handler().hits(), 1);
    }

    #[test]
    fn application_error_is_cached_and_replayed() {
        let d = dispatcher(Duration::ZERO);
        let req = request(1, 1, "x", "boom");
        let first = d.dispatch(req.clone()).unwrap();
        assert_eq!(first.result, Err(AppError::new("boom")));
        let retry = d.dispatch(req).unwrap();
        assert_eq!(retry, first);
        assert_eq!(d.handler().hits(), 1);
    }

    #[test]
    fn handler_panic_releases_waiters() {
        let d = dispatcher(Duration::ZERO);
        let req = request(1, 1, "x", "panic");
        let panicked = {
            let d = d.clone();
            let req = req.clone();
            thread::spawn(move || d.dispatch(req))
        };
        assert!(panicked.join().is_err());
        // The session completed despite the unwind; duplicates converge
        // on an application error instead of blocking forever.
        let retry = d.dispatch(req).unwrap();
        assert_eq!(retry.result, Err(AppError::new("handler panicked")));
        assert_eq!(d.handler().hits(), 1);
    }
}
