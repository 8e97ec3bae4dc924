//! Session registry shared by the manager and the session tasks
//!
//! Every check-and-reserve runs under one lock and never across an await,
//! which is what makes "one live session per call and per participant"
//! hold under concurrent callers.

use crate::call::CallError;
use crate::identity::PeerIdentity;
use crate::session::SessionCommand;
use crate::signaling::{NegotiationMessage, SequenceCheck};
use crate::types::{CallId, CallSession};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Finished sessions kept for `session()` / idempotent `end_call`
const FINISHED_RETENTION: usize = 1_024;

/// Handle to a running session task
pub(crate) struct SessionHandle<I: PeerIdentity> {
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand<I>>,
    pub(crate) snapshot: watch::Receiver<CallSession<I>>,
}

impl<I: PeerIdentity> Clone for SessionHandle<I> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

enum Slot<I: PeerIdentity> {
    Reserved,
    Live(SessionHandle<I>),
}

struct Inner<I: PeerIdentity> {
    sessions: HashMap<CallId, Slot<I>>,
    busy: HashMap<String, CallId>,
    finished: HashMap<CallId, CallSession<I>>,
    finished_order: VecDeque<CallId>,
    offers: HashMap<(CallId, String), u64>,
    locals: HashSet<String>,
    watchers: HashMap<CallId, Watcher>,
    next_watch: u64,
}

struct Watcher {
    generation: u64,
    task: JoinHandle<()>,
}

/// Shared session bookkeeping
pub(crate) struct Registry<I: PeerIdentity> {
    inner: Arc<Mutex<Inner<I>>>,
}

impl<I: PeerIdentity> Clone for Registry<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: PeerIdentity> Registry<I> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                busy: HashMap::new(),
                finished: HashMap::new(),
                finished_order: VecDeque::new(),
                offers: HashMap::new(),
                locals: HashSet::new(),
                watchers: HashMap::new(),
                next_watch: 0,
            })),
        }
    }

    /// Claim `call_id` and both participants, or fail without side effects
    pub(crate) fn reserve(
        &self,
        call_id: CallId,
        local: &I,
        remote: &I,
        max_concurrent: usize,
    ) -> Result<Reservation<I>, CallError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&call_id) {
            return Err(CallError::AlreadyInCall(format!("call {call_id} is live")));
        }
        if inner.finished.contains_key(&call_id) {
            return Err(CallError::SessionEnded(call_id));
        }
        let keys = [local.unique_id(), remote.unique_id()];
        if let Some(key) = keys.iter().find(|k| inner.busy.contains_key(*k)) {
            return Err(CallError::AlreadyInCall(key.clone()));
        }
        if inner.sessions.len() >= max_concurrent {
            return Err(CallError::ConfigError(format!(
                "Maximum concurrent calls limit reached: {max_concurrent}"
            )));
        }

        inner.sessions.insert(call_id, Slot::Reserved);
        for key in &keys {
            inner.busy.insert(key.clone(), call_id);
        }
        inner.locals.insert(local.unique_id());
        Ok(Reservation {
            registry: self.clone(),
            call_id,
            keys,
            committed: false,
        })
    }

    /// Live session handle
    pub(crate) fn handle(&self, call_id: CallId) -> Option<SessionHandle<I>> {
        match self.inner.lock().sessions.get(&call_id) {
            Some(Slot::Live(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Call is reserved or live
    pub(crate) fn is_active(&self, call_id: CallId) -> bool {
        self.inner.lock().sessions.contains_key(&call_id)
    }

    /// Handles of every live session
    pub(crate) fn live(&self) -> Vec<(CallId, SessionHandle<I>)> {
        self.inner
            .lock()
            .sessions
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Live(handle) => Some((*id, handle.clone())),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Move a session from live to finished
    pub(crate) fn finish(&self, snapshot: CallSession<I>) {
        let call_id = snapshot.call_id;
        let mut inner = self.inner.lock();
        inner.sessions.remove(&call_id);
        inner.busy.retain(|_, id| *id != call_id);
        inner.offers.retain(|(id, _), _| *id != call_id);
        if let Some(watcher) = inner.watchers.remove(&call_id) {
            watcher.task.abort();
        }
        inner.finished.insert(call_id, snapshot);
        inner.finished_order.push_back(call_id);
        while inner.finished_order.len() > FINISHED_RETENTION {
            if let Some(old) = inner.finished_order.pop_front() {
                inner.finished.remove(&old);
            }
        }
    }

    /// Final snapshot of a finished session
    pub(crate) fn finished(&self, call_id: CallId) -> Option<CallSession<I>> {
        self.inner.lock().finished.get(&call_id).cloned()
    }

    /// Record an inbound offer for a call we are not in
    pub(crate) fn observe_offer(&self, offer: &NegotiationMessage<I>) -> SequenceCheck {
        let mut inner = self.inner.lock();
        let key = (offer.call_id, offer.from.unique_id());
        match inner.offers.get(&key).copied() {
            Some(seen) if seen == offer.seq => SequenceCheck::Duplicate,
            Some(seen) if seen > offer.seq => SequenceCheck::Stale,
            _ => {
                inner.offers.insert(key, offer.seq);
                SequenceCheck::Fresh
            }
        }
    }

    /// Highest offer sequence seen for a call from `sender`
    pub(crate) fn newest_offer(&self, call_id: CallId, sender: &I) -> Option<u64> {
        self.inner
            .lock()
            .offers
            .get(&(call_id, sender.unique_id()))
            .copied()
    }

    /// Remember an identity as local
    pub(crate) fn add_local(&self, identity: &I) {
        self.inner.lock().locals.insert(identity.unique_id());
    }

    /// Identity was registered as local
    pub(crate) fn is_local(&self, identity: &I) -> bool {
        self.inner.lock().locals.contains(&identity.unique_id())
    }

    /// Spawn a watcher task for `call_id`; replaces and aborts any previous
    /// one
    ///
    /// `watch` receives the generation the task must pass to
    /// [`Registry::watch_ended`]. The task is tracked before it can run, so
    /// a watch that ends at once still finds its own entry.
    pub(crate) fn spawn_watcher<F>(&self, call_id: CallId, watch: impl FnOnce(u64) -> F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        inner.next_watch += 1;
        let generation = inner.next_watch;
        let task = tokio::spawn(watch(generation));
        if let Some(previous) = inner.watchers.insert(call_id, Watcher { generation, task }) {
            previous.task.abort();
        }
    }

    /// A watcher's stream ran out
    ///
    /// Drops the watcher entry and, unless the call was accepted or
    /// finished here, the offers recorded for it. Returns true if an
    /// announced incoming call was withdrawn.
    pub(crate) fn watch_ended(&self, call_id: CallId, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        let current = inner
            .watchers
            .get(&call_id)
            .is_some_and(|w| w.generation == generation);
        if !current {
            return false;
        }
        inner.watchers.remove(&call_id);
        if inner.sessions.contains_key(&call_id) || inner.finished.contains_key(&call_id) {
            return false;
        }
        let before = inner.offers.len();
        inner.offers.retain(|(id, _), _| *id != call_id);
        inner.offers.len() != before
    }

    /// A watcher is following `call_id`
    pub(crate) fn is_watching(&self, call_id: CallId) -> bool {
        self.inner.lock().watchers.contains_key(&call_id)
    }

    /// Calls with a recorded offer that are not live or finished here
    pub(crate) fn pending_incoming(&self) -> Vec<CallId> {
        let inner = self.inner.lock();
        let mut calls: Vec<CallId> = inner
            .offers
            .keys()
            .map(|(call_id, _)| *call_id)
            .filter(|id| !inner.sessions.contains_key(id) && !inner.finished.contains_key(id))
            .collect();
        calls.sort_by_key(|id| id.0);
        calls.dedup();
        calls
    }

    /// Stop watching a call
    pub(crate) fn stop_watcher(&self, call_id: CallId) {
        if let Some(watcher) = self.inner.lock().watchers.remove(&call_id) {
            watcher.task.abort();
        }
    }

    /// Stop every watcher
    pub(crate) fn stop_all_watchers(&self) {
        for (_, watcher) in self.inner.lock().watchers.drain() {
            watcher.task.abort();
        }
    }

    /// Forget a pending incoming call
    pub(crate) fn forget_offers(&self, call_id: CallId) {
        self.inner.lock().offers.retain(|(id, _), _| *id != call_id);
    }
}

/// Claim on a call id and its participants
///
/// Released on drop unless [`Reservation::commit`] turned it into a live
/// session.
pub(crate) struct Reservation<I: PeerIdentity> {
    registry: Registry<I>,
    call_id: CallId,
    keys: [String; 2],
    committed: bool,
}

impl<I: PeerIdentity> Reservation<I> {
    /// Publish the running session under this reservation
    pub(crate) fn commit(mut self, handle: SessionHandle<I>) {
        let mut inner = self.registry.inner.lock();
        inner.sessions.insert(self.call_id, Slot::Live(handle));
        self.committed = true;
    }
}

impl<I: PeerIdentity> Drop for Reservation<I> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.registry.inner.lock();
        if matches!(inner.sessions.get(&self.call_id), Some(Slot::Reserved)) {
            inner.sessions.remove(&self.call_id);
        }
        for key in &self.keys {
            if inner.busy.get(key) == Some(&self.call_id) {
                inner.busy.remove(key);
            }
        }
        tracing::debug!(call_id = %self.call_id, "Reservation released");
    }
}
