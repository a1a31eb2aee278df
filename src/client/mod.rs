//! Client sessions.
//!
//! A [`ClientSession`] observes the signals a client subscribed to and pushes
//! their descriptions to a bounded stream. Inside a [`DispatchRound`] pushes
//! are buffered per session and sent once when the outermost round ends, so
//! one incoming event yields at most one push per client however many of
//! its signals changed.

/// Receiving end of a session.
pub mod stream;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::observer::{Notifiable, Notifier, Subscriptions};
use crate::signal::{Signal, SignalDescription};

pub use stream::ClientStream;

/// Opaque handle identifying a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One push to a client.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub session: SessionId,
    pub timestamp: DateTime<Utc>,
    /// Changed signals, sorted by id.
    pub signals: Vec<SignalDescription>,
}

#[derive(Default)]
struct RoundState {
    depth: usize,
    dirty: Vec<Arc<ClientSession>>,
}

thread_local! {
    static ROUND: RefCell<RoundState> = RefCell::new(RoundState::default());
}

/// Groups the notifications of one incoming event on the current thread.
///
/// Rounds nest; buffered pushes are flushed when the outermost guard drops.
#[must_use = "the round ends when the guard is dropped"]
pub struct DispatchRound {
    _thread_bound: PhantomData<*const ()>,
}

impl DispatchRound {
    /// Opens a round on this thread. Pushes are sent when the outermost round ends.
    pub fn begin() -> Self {
        ROUND.with(|r| r.borrow_mut().depth += 1);
        Self {
            _thread_bound: PhantomData,
        }
    }

    /// True when a round is open on this thread.
    #[must_use]
    pub fn is_open() -> bool {
        ROUND.with(|r| r.borrow().depth > 0)
    }

    fn enlist(session: Arc<ClientSession>) {
        ROUND.with(|r| r.borrow_mut().dirty.push(session));
    }
}

impl Drop for DispatchRound {
    fn drop(&mut self) {
        let dirty = ROUND.with(|r| {
            let mut state = r.borrow_mut();
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                std::mem::take(&mut state.dirty)
            } else {
                Vec::new()
            }
        });
        for session in dirty {
            session.flush();
        }
    }
}

impl std::fmt::Debug for DispatchRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRound").finish()
    }
}

/// Per-client observer of signals.
pub struct ClientSession {
    id: SessionId,
    me: Weak<ClientSession>,
    tx: Sender<SignalEvent>,
    pending: Mutex<BTreeMap<String, SignalDescription>>,
    subscriptions: Subscriptions<Signal>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ClientSession {
    /// Creates a session whose stream buffers up to `capacity` pushes.
    #[must_use]
    pub fn open(capacity: usize) -> (Arc<Self>, ClientStream) {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        let id = SessionId::new();
        let session = Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            tx,
            pending: Mutex::new(BTreeMap::new()),
            subscriptions: Subscriptions::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        (session, ClientStream::new(id, rx))
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Observes each signal. Returns how many were not observed before.
    pub fn subscribe(this: &Arc<Self>, signals: &[Arc<Signal>]) -> usize {
        let observer: Arc<dyn Notifiable<Signal>> = this.clone();
        signals
            .iter()
            .filter(|signal| Signal::add_observer(signal, &observer))
            .count()
    }

    /// Stops observing each signal.
    pub fn unsubscribe(&self, signals: &[Arc<Signal>]) {
        for signal in signals {
            signal.del_observer(self);
        }
    }

    /// Ids of the signals currently observed.
    #[must_use]
    pub fn subscribed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .snapshot()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Pushes dropped because the stream buffer was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// True once the stream is gone or the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Detaches from every signal. Later updates are ignored.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(session = %self.id, "session closed");
        }
        self.subscriptions.release(self);
    }

    fn flush(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        if !batch.is_empty() {
            self.push(batch.into_values().collect());
        }
    }

    fn push(&self, signals: Vec<SignalDescription>) {
        if self.is_closed() {
            return;
        }
        let event = SignalEvent {
            session: self.id,
            timestamp: Utc::now(),
            signals,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(session = %self.id, "client stream full, push dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(session = %self.id, "client stream gone, detaching");
                self.close();
            }
        }
    }
}

impl Notifiable<Signal> for ClientSession {
    fn update(&self, source: &Signal) {
        if self.is_closed() {
            return;
        }
        let description = source.describe();
        if !DispatchRound::is_open() {
            self.push(vec![description]);
            return;
        }

        let first = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let first = pending.is_empty();
            pending.insert(description.uid.clone(), description);
            first
        };
        if first {
            if let Some(me) = self.me.upgrade() {
                DispatchRound::enlist(me);
            }
        }
    }

    fn subscriptions(&self) -> &Subscriptions<Signal> {
        &self.subscriptions
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.subscriptions.release(&*self);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("subscribed", &self.subscribed())
            .field("dropped", &self.dropped_events())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::TimeSeriesValue;
    use std::time::Duration;

    fn raw(id: &str) -> Arc<Signal> {
        Signal::builder(id).event(format!("low-can/{id}")).build().unwrap()
    }

    #[test]
    fn test_push_outside_round_is_immediate() {
        let (session, stream) = ClientSession::open(8);
        let speed = raw("speed");
        assert_eq!(ClientSession::subscribe(&session, &[speed.clone()]), 1);

        speed.set(1, TimeSeriesValue::from(5.0));
        speed.notify();

        let event = stream.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.session, session.id());
        assert_eq!(event.signals.len(), 1);
        assert_eq!(event.signals[0].uid, "speed");
        assert_eq!(event.signals[0].value, Some(TimeSeriesValue::from(5.0)));
    }

    #[test]
    fn test_round_coalesces_into_one_push() {
        let (session, stream) = ClientSession::open(8);
        let a = raw("a");
        let b = raw("b");
        ClientSession::subscribe(&session, &[a.clone(), b.clone()]);

        {
            let _round = DispatchRound::begin();
            a.notify();
            b.notify();
            a.notify();
            assert!(stream.try_recv().unwrap().is_none());
        }

        let event = stream.try_recv().unwrap().unwrap();
        let ids: Vec<&str> = event.signals.iter().map(|s| s.uid.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(stream.try_recv().unwrap().is_none());
    }

    #[test]
    fn test_overlapping_subscriptions_are_idempotent() {
        let (session, _stream) = ClientSession::open(8);
        let a = raw("a");
        assert_eq!(ClientSession::subscribe(&session, &[a.clone(), a.clone()]), 1);
        assert_eq!(ClientSession::subscribe(&session, &[a.clone()]), 0);
        assert_eq!(a.observers().len(), 1);
        assert_eq!(session.subscribed(), vec!["a".to_string()]);
    }

    #[test]
    fn test_full_stream_counts_drops() {
        let (session, _stream) = ClientSession::open(1);
        let a = raw("a");
        ClientSession::subscribe(&session, &[a.clone()]);
        a.notify();
        a.notify();
        assert_eq!(session.dropped_events(), 1);
    }

    #[test]
    fn test_dropped_stream_detaches_session() {
        let (session, stream) = ClientSession::open(4);
        let a = raw("a");
        ClientSession::subscribe(&session, &[a.clone()]);
        drop(stream);

        a.notify();
        assert!(session.is_closed());
        assert!(a.observers().is_empty());
    }

    #[test]
    fn test_unsubscribe_and_close() {
        let (session, _stream) = ClientSession::open(4);
        let a = raw("a");
        let b = raw("b");
        ClientSession::subscribe(&session, &[a.clone(), b.clone()]);
        session.unsubscribe(&[a.clone()]);
        assert_eq!(session.subscribed(), vec!["b".to_string()]);

        session.close();
        assert!(session.subscribed().is_empty());
        assert!(b.observers().is_empty());
    }

    #[test]
    fn test_nested_rounds_flush_once() {
        let (session, stream) = ClientSession::open(8);
        let a = raw("a");
        ClientSession::subscribe(&session, &[a.clone()]);
        {
            let _outer = DispatchRound::begin();
            {
                let _inner = DispatchRound::begin();
                a.notify();
            }
            assert!(DispatchRound::is_open());
            assert!(stream.try_recv().unwrap().is_none());
        }
        assert!(!DispatchRound::is_open());
        assert!(stream.try_recv().unwrap().is_some());
    }
}
