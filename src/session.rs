//! Per-client progress records and the table that holds them.
//!
//! A session is a single scalar of progress (`last_seq`) plus the state
//! of the call that owns it. The single-flight client contract is what
//! makes the scalar sufficient: at most one sequence number per client
//! is ever outstanding, so there is nothing for a window to hold.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{AppResult, ClientId, SeqNo, DEFAULT_SESSION_SHARDS};

/// Durability hook around session completion.
///
/// `persist` is invoked synchronously before a completed reply becomes
/// observable, `restore` once at table construction. Without a store,
/// a process restart loses all session state and the at-most-once
/// guarantee holds only between restarts.
pub trait SessionStore<R>: Send + Sync {
    fn persist(&self, client: ClientId, seq: SeqNo, result: &AppResult<R>);
    fn restore(&self) -> Vec<(ClientId, SeqNo, AppResult<R>)>;
}

/// What the session decides about an incoming `(client, seq)` pair.
#[derive(Debug)]
pub enum Admission<R> {
    /// A new call. The session is now marked executing; the caller must
    /// run the handler and publish the outcome with
    /// [`Session::complete`].
    Execute,
    /// A call on this session is still executing. Wait for it
    /// ([`Session::await_idle`]) and admit again.
    Wait,
    /// Duplicate of a completed call. Answer with the cached result, do
    /// not re-execute.
    Replay(AppResult<R>),
    /// Duplicate of a call the client has already moved past. Discard
    /// without replying.
    Stale { last_seq: SeqNo },
    /// The client skipped ahead of the recorded progress, or sent the
    /// reserved sequence number 0. Reject without executing.
    OutOfOrder { last_seq: SeqNo },
}

pub(crate) enum Progress<R> {
    /// Lazily created entry, nothing recorded yet. Whatever sequence
    /// number arrives first is adopted as the new call, so a client
    /// evicted for inactivity is not stranded when it comes back.
    Fresh,
    Executing,
    Completed(AppResult<R>),
}

pub(crate) struct SessionState<R> {
    pub(crate) last_seq: SeqNo,
    pub(crate) progress: Progress<R>,
    touched: Instant,
}

impl<R: Clone> SessionState<R> {
    pub(crate) fn new() -> Self {
        Self { last_seq: 0, progress: Progress::Fresh, touched: Instant::now() }
    }

    fn restored(last_seq: SeqNo, result: AppResult<R>) -> Self {
        Self { last_seq, progress: Progress::Completed(result), touched: Instant::now() }
    }

    pub(crate) fn is_executing(&self) -> bool {
        matches!(self.progress, Progress::Executing)
    }

    /// Classify `seq` against the recorded progress and, for a new
    /// call, transition to executing.
    pub(crate) fn admit(&mut self, seq: SeqNo) -> Admission<R> {
        self.touched = Instant::now();
        if seq == 0 {
            return Admission::OutOfOrder { last_seq: self.last_seq };
        }
        match &self.progress {
            Progress::Fresh => {
                self.last_seq = seq;
                self.progress = Progress::Executing;
                Admission::Execute
            }
            Progress::Executing => {
                if seq < self.last_seq {
                    Admission::Stale { last_seq: self.last_seq }
                } else if seq == self.last_seq || seq == self.last_seq + 1 {
                    // The next call serializes behind the running one;
                    // admitting it immediately would put two calls in
                    // flight for one session.
                    Admission::Wait
                } else {
                    Admission::OutOfOrder { last_seq: self.last_seq }
                }
            }
            Progress::Completed(result) => {
                if seq < self.last_seq {
                    Admission::Stale { last_seq: self.last_seq }
                } else if seq == self.last_seq {
                    Admission::Replay(result.clone())
                } else if seq == self.last_seq + 1 {
                    self.last_seq = seq;
                    self.progress = Progress::Executing;
                    Admission::Execute
                } else {
                    Admission::OutOfOrder { last_seq: self.last_seq }
                }
            }
        }
    }

    pub(crate) fn finish(&mut self, seq: SeqNo, result: AppResult<R>) {
        debug_assert!(self.is_executing());
        debug_assert_eq!(self.last_seq, seq);
        self.last_seq = seq;
        self.progress = Progress::Completed(result);
        self.touched = Instant::now();
    }
}

/// One client's progress record plus the wait/notify primitive that
/// duplicate requests block on.
pub struct Session<R> {
    client: ClientId,
    state: Mutex<SessionState<R>>,
    completed: Condvar,
    store: Option<Arc<dyn SessionStore<R>>>,
}

impl<R: Clone> Session<R> {
    fn new(client: ClientId, store: Option<Arc<dyn SessionStore<R>>>) -> Self {
        Self { client, state: Mutex::new(SessionState::new()), completed: Condvar::new(), store }
    }

    fn restored(
        client: ClientId,
        last_seq: SeqNo,
        result: AppResult<R>,
        store: Option<Arc<dyn SessionStore<R>>>,
    ) -> Self {
        Self {
            client,
            state: Mutex::new(SessionState::restored(last_seq, result)),
            completed: Condvar::new(),
            store,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn admit(&self, seq: SeqNo) -> Admission<R> {
        self.state.lock().unwrap().admit(seq)
    }

    /// Block until no call is executing on this session.
    pub fn await_idle(&self) {
        let mut state = self.state.lock().unwrap();
        while state.is_executing() {
            state = self.completed.wait(state).unwrap();
        }
    }

    /// Publish the result of the executing call and release every
    /// waiter. The result is persisted before it becomes observable.
    pub fn complete(&self, seq: SeqNo, result: AppResult<R>) {
        if let Some(store) = &self.store {
            store.persist(self.client, seq, &result);
        }
        self.state.lock().unwrap().finish(seq, result);
        self.completed.notify_all();
    }
}

type Shard<R> = Mutex<HashMap<ClientId, Arc<Session<R>>>>;

/// Per-client sessions, sharded by client id so unrelated clients never
/// contend on one lock. A shard lock is held only for map lookups; all
/// waiting happens on the individual session.
pub struct SessionTable<R> {
    shards: Box<[Shard<R>]>,
    store: Option<Arc<dyn SessionStore<R>>>,
}

impl<R: Clone> SessionTable<R> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SESSION_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        assert!(shards > 0);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            store: None,
        }
    }

    /// Replays every record the store holds, then persists through it
    /// from here on.
    pub fn with_store(store: Arc<dyn SessionStore<R>>) -> Self {
        let mut table = Self::new();
        table.store = Some(store.clone());
        for (client, seq, result) in store.restore() {
            let session = Arc::new(Session::restored(client, seq, result, Some(store.clone())));
            table.shard(client).lock().unwrap().insert(client, session);
        }
        table
    }

    fn shard(&self, client: ClientId) -> &Shard<R> {
        &self.shards[client.as_u64() as usize % self.shards.len()]
    }

    /// Returns the session for `client`, creating it on first contact.
    pub fn session(&self, client: ClientId) -> Arc<Session<R>> {
        let mut shard = self.shard(client).lock().unwrap();
        shard
            .entry(client)
            .or_insert_with(|| Arc::new(Session::new(client, self.store.clone())))
            .clone()
    }

    /// Drops sessions that have been idle for longer than `horizon`.
    /// A session whose call is still executing is never evicted.
    /// Returns how many were removed.
    ///
    /// An evicted client that retransmits a very old call will have it
    /// re-executed as a fresh one; absent a [`SessionStore`] that is the
    /// accepted cost of bounding the table.
    pub fn evict_idle(&self, horizon: Duration) -> usize {
        let mut evicted = 0;
        for shard in self.shards.iter() {
            shard.lock().unwrap().retain(|client, session| {
                let state = session.state.lock().unwrap();
                if state.is_executing() || state.touched.elapsed() <= horizon {
                    true
                } else {
                    debug!(client = %client, last_seq = state.last_seq, "evicting idle session");
                    evicted += 1;
                    false
                }
            });
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Clone> Default for SessionTable<R> {
    fn default() -> Self {
        Self::new()
    }
}
