//! Session registry.
//!
//! A session outlives its connection when the client asked for a persistent
//! session. The registry keeps at most one live connection per client id:
//! a second CONNECT with the same id evicts the first (takeover).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dispatcher::InflightRecord;
use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::router::TopicRouter;
use crate::store::{SessionSnapshot, StoredMessage, Store};
use crate::types::{Message, QoS};

/// Why a connection was told to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Another connection claimed the same client id.
    TakenOver,
    /// The outbound queue overflowed.
    SlowConsumer,
}

/// Eviction signal shared between a session and its connection task.
#[derive(Debug, Default)]
pub struct Eviction {
    token: CancellationToken,
    reason: Mutex<Option<EvictReason>>,
}

impl Eviction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the connection. The first reason wins.
    pub fn evict(&self, reason: EvictReason) {
        let mut current = self.reason.lock();
        if current.is_none() {
            *current = Some(reason);
        }
        drop(current);
        self.token.cancel();
    }

    /// Wait until evicted and return the reason.
    pub async fn evicted(&self) -> EvictReason {
        self.token.cancelled().await;
        let reason = *self.reason.lock();
        reason.unwrap_or(EvictReason::TakenOver)
    }

    pub fn is_evicted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Link from a session to the connection currently serving it.
#[derive(Debug, Clone)]
pub struct SessionLink {
    pub conn_id: u64,
    pub tx: mpsc::WeakSender<Packet>,
    pub eviction: Arc<Eviction>,
}

/// Mutable session state. Guarded by [`Session::state`].
#[derive(Debug)]
pub(crate) struct SessionState {
    pub clean_session: bool,
    pub subscriptions: HashMap<String, QoS>,
    /// Messages waiting for an in-flight slot or for the client to return.
    /// Each carries its effective delivery QoS.
    pub pending: VecDeque<Message>,
    pub inflight: BTreeMap<u16, InflightRecord>,
    /// In-flight packet ids waiting for room in the outbound channel, in
    /// send order.
    pub outbox: VecDeque<u16>,
    /// Inbound QoS 2 packet ids received but not yet released.
    pub incoming_qos2: HashSet<u16>,
    next_pkid: u16,
    pub link: Option<SessionLink>,
}

impl SessionState {
    fn new(clean_session: bool) -> Self {
        Self {
            clean_session,
            subscriptions: HashMap::new(),
            pending: VecDeque::new(),
            inflight: BTreeMap::new(),
            outbox: VecDeque::new(),
            incoming_qos2: HashSet::new(),
            next_pkid: 0,
            link: None,
        }
    }

    /// Next free outbound packet id, skipping ids still in flight.
    /// Returns `None` when all 65535 ids are taken.
    pub fn next_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            self.next_pkid = self.next_pkid.wrapping_add(1);
            if self.next_pkid == 0 {
                self.next_pkid = 1;
            }
            if !self.inflight.contains_key(&self.next_pkid) {
                return Some(self.next_pkid);
            }
        }
        None
    }

    /// Strong sender to the live connection, if any.
    pub fn sender(&self) -> Option<mpsc::Sender<Packet>> {
        self.link.as_ref().and_then(|link| link.tx.upgrade())
    }

    fn snapshot(&self, client_id: &str) -> SessionSnapshot {
        let mut subscriptions: Vec<(String, u8)> = self
            .subscriptions
            .iter()
            .map(|(filter, qos)| (filter.clone(), qos.as_u8()))
            .collect();
        subscriptions.sort();

        let pending = self
            .inflight
            .values()
            .map(|record| StoredMessage::from(&record.message))
            .chain(self.pending.iter().map(StoredMessage::from))
            .collect();

        SessionSnapshot {
            client_id: client_id.to_string(),
            subscriptions,
            pending,
        }
    }
}

/// Per-client session.
#[derive(Debug)]
pub struct Session {
    id: Arc<str>,
    pub(crate) state: Mutex<SessionState>,
    /// Set when a delivery found the outbound channel full.
    pub(crate) stalled: AtomicBool,
}

impl Session {
    fn new(id: &str, clean_session: bool) -> Self {
        Self {
            id: Arc::from(id),
            state: Mutex::new(SessionState::new(clean_session)),
            stalled: AtomicBool::new(false),
        }
    }

    /// Client identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True while a connection is attached.
    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// True for clean (non-persistent) sessions.
    pub fn is_clean(&self) -> bool {
        self.state.lock().clean_session
    }

    /// Subscriptions sorted by filter.
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        let state = self.state.lock();
        let mut subs: Vec<(String, QoS)> = state
            .subscriptions
            .iter()
            .map(|(f, q)| (f.clone(), *q))
            .collect();
        subs.sort();
        subs
    }

    /// Number of queued messages.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of unacknowledged QoS 1/2 deliveries.
    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// Record an inbound QoS 2 packet id. Returns false for a duplicate
    /// that must not be routed again.
    pub fn begin_incoming_qos2(&self, pkid: u16) -> bool {
        self.state.lock().incoming_qos2.insert(pkid)
    }

    /// Release an inbound QoS 2 packet id after PUBREL.
    pub fn release_incoming_qos2(&self, pkid: u16) {
        self.state.lock().incoming_qos2.remove(&pkid);
    }

    /// True when `conn_id` is the attached connection.
    pub fn is_owned_by(&self, conn_id: u64) -> bool {
        self.state
            .lock()
            .link
            .as_ref()
            .is_some_and(|link| link.conn_id == conn_id)
    }
}

/// Result of [`SessionRegistry::connect`].
#[derive(Debug)]
pub struct ConnectOutcome {
    pub session: Arc<Session>,
    /// A live connection held the id and was told to close.
    pub evicted_previous: bool,
    /// Prior persistent state was resumed.
    pub session_present: bool,
}

/// Registry of sessions keyed by client id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    router: Arc<TopicRouter>,
    store: Arc<dyn Store>,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(router: Arc<TopicRouter>, store: Arc<dyn Store>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            router,
            store,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new connection.
    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session for `client_id` without attaching a connection.
    pub fn connect(&self, client_id: &str, clean_session: bool) -> ConnectOutcome {
        self.attach(client_id, clean_session, None)
    }

    /// Register a session and bind it to `link`.
    ///
    /// A live previous connection is evicted. Prior state is discarded when
    /// either side asked for a clean session, otherwise it is resumed.
    pub fn attach(
        &self,
        client_id: &str,
        clean_session: bool,
        link: Option<SessionLink>,
    ) -> ConnectOutcome {
        let mut evicted_previous = false;
        let mut discarded: Vec<String> = Vec::new();

        let mut sessions = self.sessions.write();
        let (session, session_present) = match sessions.get(client_id).cloned() {
            Some(existing) => {
                let mut state = existing.state.lock();
                if let Some(old) = state.link.take() {
                    old.eviction.evict(EvictReason::TakenOver);
                    evicted_previous = true;
                }

                if clean_session || state.clean_session {
                    discarded.extend(state.subscriptions.drain().map(|(filter, _)| filter));
                    drop(state);
                    let fresh = Arc::new(Session::new(client_id, clean_session));
                    fresh.state.lock().link = link;
                    sessions.insert(client_id.to_string(), Arc::clone(&fresh));
                    (fresh, false)
                } else {
                    state.link = link;
                    drop(state);
                    (existing, true)
                }
            }
            None => {
                let fresh = Arc::new(Session::new(client_id, clean_session));
                fresh.state.lock().link = link;
                sessions.insert(client_id.to_string(), Arc::clone(&fresh));
                (fresh, false)
            }
        };
        drop(sessions);

        if !discarded.is_empty() {
            self.router
                .unsubscribe_all(client_id, discarded.iter().map(String::as_str));
        }
        if clean_session {
            if let Err(e) = self.store.remove_session(client_id) {
                warn!("Failed to remove stored session {}: {}", client_id, e);
            }
        }

        debug!(
            "Session {} attached (clean={}, present={}, takeover={})",
            client_id, clean_session, session_present, evicted_previous
        );

        ConnectOutcome {
            session,
            evicted_previous,
            session_present,
        }
    }

    /// Detach whatever connection serves `client_id`.
    pub fn disconnect(&self, client_id: &str, graceful: bool) -> bool {
        self.detach_inner(client_id, None, graceful)
    }

    /// Detach connection `conn_id` from `client_id`.
    ///
    /// No-op when a newer connection already owns the session.
    pub fn detach(&self, client_id: &str, conn_id: u64, graceful: bool) -> bool {
        self.detach_inner(client_id, Some(conn_id), graceful)
    }

    fn detach_inner(&self, client_id: &str, conn_id: Option<u64>, graceful: bool) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get(client_id).cloned() else {
            return false;
        };

        let mut state = session.state.lock();
        if let Some(conn_id) = conn_id {
            if state.link.as_ref().map(|l| l.conn_id) != Some(conn_id) {
                return false;
            }
        }
        state.link = None;

        if state.clean_session {
            let filters: Vec<String> = state.subscriptions.keys().cloned().collect();
            drop(state);
            sessions.remove(client_id);
            drop(sessions);

            self.router
                .unsubscribe_all(client_id, filters.iter().map(String::as_str));
            debug!("Session {} removed (graceful={})", client_id, graceful);
        } else {
            let snapshot = state.snapshot(client_id);
            drop(state);
            drop(sessions);

            if let Err(e) = self.store.save_session(&snapshot) {
                warn!("Failed to save session {}: {}", client_id, e);
            }
            debug!("Session {} offline (graceful={})", client_id, graceful);
        }
        true
    }

    /// Look up a session.
    pub fn lookup(&self, client_id: &str) -> Result<Arc<Session>> {
        self.get(client_id)
            .ok_or_else(|| Error::NotFound(client_id.to_string()))
    }

    pub(crate) fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Number of registered sessions, online or not.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Subscribe a session to `filter`.
    ///
    /// Fails with [`Error::NotFound`] when `session` is no longer the
    /// registered session for its id, e.g. after a clean takeover.
    pub fn subscribe(&self, session: &Session, filter: &str, qos: QoS) -> Result<()> {
        let sessions = self.sessions.read();
        if !is_registered(&sessions, session) {
            return Err(Error::NotFound(session.id().to_string()));
        }
        self.router.subscribe(session.id(), filter, qos)?;
        session
            .state
            .lock()
            .subscriptions
            .insert(filter.to_string(), qos);
        Ok(())
    }

    /// Unsubscribe a session from `filter`. Unknown filters and replaced
    /// sessions are ignored.
    pub fn unsubscribe(&self, session: &Session, filter: &str) {
        let sessions = self.sessions.read();
        if !is_registered(&sessions, session) {
            return;
        }
        self.router.unsubscribe(session.id(), filter);
        session.state.lock().subscriptions.remove(filter);
    }

    /// Recreate an offline persistent session from a snapshot.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        let session = Arc::new(Session::new(&snapshot.client_id, false));
        for (filter, qos) in &snapshot.subscriptions {
            let qos = QoS::from_u8(*qos).unwrap_or_default();
            match self.router.subscribe(&snapshot.client_id, filter, qos) {
                Ok(()) => {
                    session
                        .state
                        .lock()
                        .subscriptions
                        .insert(filter.clone(), qos);
                }
                Err(e) => warn!("Skipping stored subscription {}: {}", filter, e),
            }
        }
        session
            .state
            .lock()
            .pending
            .extend(
                snapshot
                    .pending
                    .into_iter()
                    .map(Message::from)
                    .filter(|msg| msg.qos != QoS::AtMostOnce),
            );

        debug!("Session {} restored", snapshot.client_id);
        self.sessions.write().insert(snapshot.client_id, session);
    }

    /// Save every persistent session to the store.
    pub fn save_persistent(&self) {
        for session in self.sessions() {
            let state = session.state.lock();
            if state.clean_session {
                continue;
            }
            let snapshot = state.snapshot(session.id());
            drop(state);
            if let Err(e) = self.store.save_session(&snapshot) {
                warn!("Failed to save session {}: {}", session.id(), e);
            }
        }
    }
}

fn is_registered(sessions: &HashMap<String, Arc<Session>>, session: &Session) -> bool {
    sessions
        .get(session.id())
        .is_some_and(|current| std::ptr::eq(current.as_ref(), session))
}
