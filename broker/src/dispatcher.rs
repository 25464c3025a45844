//! Publish pipeline.
//!
//! The dispatcher routes a message to every matching session, tracks QoS 1
//! and QoS 2 deliveries until they are acknowledged and redelivers them from
//! a background retry loop.
//!
//! Delivery never waits on a subscriber: packets are pushed into each
//! connection's bounded outbound channel with `try_send`. When a channel is
//! full a QoS 0 packet is dropped. A QoS 1/2 packet stays in flight and waits
//! in the session outbox, which is flushed in order once the connection has
//! written packets out or the retry loop fires. New deliveries queue behind it.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::protocol::{self, Packet, PubRel};
use crate::router::TopicRouter;
use crate::session::{EvictReason, Session, SessionRegistry, SessionState};
use crate::store::Store;
use crate::types::{Message, QoS};

/// Callback for delivery failures.
pub type FailureCallback = Arc<dyn Fn(&DeliveryFailure) + Send + Sync>;

/// Acknowledgement an in-flight delivery is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    AwaitingPubAck,
    AwaitingPubRec,
    AwaitingPubComp,
}

/// Unacknowledged QoS 1/2 delivery.
#[derive(Debug, Clone)]
pub struct InflightRecord {
    /// Message as delivered (QoS already downgraded).
    pub message: Message,
    pub pkid: u16,
    pub state: AckState,
    /// Handed to a connection at least once.
    pub sent: bool,
    /// Redeliveries so far.
    pub attempts: u32,
    pub last_sent: Instant,
}

impl InflightRecord {
    fn packet(&self, dup: bool) -> Packet {
        match self.state {
            AckState::AwaitingPubComp => Packet::PubRel(PubRel::new(self.pkid)),
            _ => protocol::create_publish(
                &self.message,
                self.message.qos,
                self.pkid,
                self.message.retain,
                dup,
            ),
        }
    }
}

/// Why a delivery was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No acknowledgement after the configured number of redeliveries.
    RetriesExhausted,
    /// Outbound channel or pending queue full.
    QueueFull,
    /// The subscriber was disconnected for not keeping up.
    SlowConsumer,
}

/// Delivery failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub client_id: String,
    pub topic: String,
    /// Packet id, or 0 for QoS 0 deliveries.
    pub pkid: u16,
    pub reason: FailureReason,
}

/// Outcome of a single publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Sessions whose subscriptions matched.
    pub matched: usize,
    /// Packets handed to connections.
    pub delivered: usize,
    /// Messages parked in a pending queue.
    pub queued: usize,
    /// Messages dropped.
    pub dropped: usize,
}

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Unacknowledged QoS 1/2 deliveries allowed per session.
    pub max_inflight: usize,
    /// Messages a session may queue beyond the in-flight window.
    pub max_pending: usize,
    /// Time before an unacknowledged delivery is sent again.
    pub retry_interval: Duration,
    /// Redeliveries before a delivery is abandoned.
    pub max_retries: u32,
    /// Evict connections whose outbound channel is full.
    pub disconnect_slow_consumers: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            max_pending: 1000,
            retry_interval: Duration::from_secs(5),
            max_retries: 5,
            disconnect_slow_consumers: false,
        }
    }
}

enum Outcome {
    Delivered,
    Queued,
    Dropped,
}

/// Routes messages and tracks acknowledgements.
pub struct Dispatcher {
    router: Arc<TopicRouter>,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn Store>,
    config: DeliveryConfig,
    on_failure: Option<FailureCallback>,
}

impl Dispatcher {
    pub fn new(
        router: Arc<TopicRouter>,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn Store>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            router,
            registry,
            store,
            config,
            on_failure: None,
        }
    }

    /// Set the delivery failure callback.
    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Route `msg` to every matching session.
    ///
    /// `origin` is the publishing client, if any, and is only used for logs.
    pub fn publish(&self, msg: &Message, origin: Option<&str>) -> DeliveryReceipt {
        if msg.retain {
            self.router.set_retained(&msg.topic, msg.clone());
            let stored = (!msg.payload.is_empty()).then_some(msg);
            if let Err(e) = self.store.save_retained(&msg.topic, stored) {
                warn!("Failed to store retained message on {}: {}", msg.topic, e);
            }
        }

        let matches = self.router.matches(&msg.topic);
        let mut receipt = DeliveryReceipt {
            matched: matches.len(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        let now = Instant::now();

        for (session_id, granted) in matches {
            let Some(session) = self.registry.get(&session_id) else {
                receipt.dropped += 1;
                continue;
            };
            let qos = msg.qos.min(granted);
            let outcome = self.deliver(&session, msg, qos, false, now, &mut failures);
            match outcome {
                Outcome::Delivered => receipt.delivered += 1,
                Outcome::Queued => receipt.queued += 1,
                Outcome::Dropped => receipt.dropped += 1,
            }
        }

        trace!(
            "Routed {} from {}: {:?}",
            msg.topic,
            origin.unwrap_or("$broker"),
            receipt
        );
        self.report(failures);
        receipt
    }

    /// Deliver retained messages matching `filter` to a new subscriber.
    pub fn deliver_retained(&self, session: &Session, filter: &str, granted: QoS) -> usize {
        let mut failures = Vec::new();
        let now = Instant::now();
        let mut delivered = 0;
        for msg in self.router.retained(filter) {
            let qos = msg.qos.min(granted);
            if let Outcome::Delivered = self.deliver(session, &msg, qos, true, now, &mut failures) {
                delivered += 1;
            }
        }
        self.report(failures);
        delivered
    }

    fn deliver(
        &self,
        session: &Session,
        msg: &Message,
        qos: QoS,
        retain: bool,
        now: Instant,
        failures: &mut Vec<DeliveryFailure>,
    ) -> Outcome {
        let mut msg = msg.clone();
        msg.qos = qos;
        msg.retain = retain;

        let mut state = session.state.lock();

        if qos == QoS::AtMostOnce {
            let Some(tx) = state.sender() else {
                return Outcome::Dropped;
            };
            let packet = protocol::create_publish(&msg, qos, 0, retain, false);
            return match tx.try_send(packet) {
                Ok(()) => Outcome::Delivered,
                Err(TrySendError::Full(_)) => {
                    let reason = self.on_full(&state);
                    failures.push(failure(session.id(), &msg.topic, 0, reason));
                    Outcome::Dropped
                }
                Err(TrySendError::Closed(_)) => Outcome::Dropped,
            };
        }

        if state.link.is_none() && state.clean_session {
            return Outcome::Dropped;
        }

        if state.link.is_none()
            || state.inflight.len() >= self.window()
            || !state.outbox.is_empty()
            || !state.pending.is_empty()
        {
            if state.pending.len() >= self.config.max_pending {
                failures.push(failure(session.id(), &msg.topic, 0, FailureReason::QueueFull));
                return Outcome::Dropped;
            }
            state.pending.push_back(msg);
            return Outcome::Queued;
        }

        if self.send_new(session, &mut state, msg, now, failures) {
            Outcome::Delivered
        } else {
            Outcome::Queued
        }
    }

    /// In-flight slots per session, capped by the packet id space.
    fn window(&self) -> usize {
        self.config.max_inflight.min(usize::from(u16::MAX))
    }

    /// Start a new in-flight delivery. Returns true when the packet went
    /// straight into the channel; otherwise it waits in the outbox.
    fn send_new(
        &self,
        session: &Session,
        state: &mut SessionState,
        msg: Message,
        now: Instant,
        failures: &mut Vec<DeliveryFailure>,
    ) -> bool {
        let Some(pkid) = state.next_packet_id() else {
            state.pending.push_front(msg);
            return false;
        };
        let record = InflightRecord {
            pkid,
            state: match msg.qos {
                QoS::ExactlyOnce => AckState::AwaitingPubRec,
                _ => AckState::AwaitingPubAck,
            },
            sent: false,
            attempts: 0,
            last_sent: now,
            message: msg,
        };
        state.inflight.insert(pkid, record);
        state.outbox.push_back(pkid);
        self.flush_outbox(session, state, now, failures);
        !state.outbox.contains(&pkid)
    }

    /// Hand outbox records to the connection in order, stopping at the
    /// first full channel.
    fn flush_outbox(
        &self,
        session: &Session,
        state: &mut SessionState,
        now: Instant,
        failures: &mut Vec<DeliveryFailure>,
    ) {
        let Some(tx) = state.sender() else {
            return;
        };
        while let Some(&pkid) = state.outbox.front() {
            let Some(record) = state.inflight.get_mut(&pkid) else {
                state.outbox.pop_front();
                continue;
            };
            match tx.try_send(record.packet(record.sent)) {
                Ok(()) => {
                    record.sent = true;
                    record.last_sent = now;
                    state.outbox.pop_front();
                }
                Err(TrySendError::Full(_)) => {
                    let topic = record.message.topic.clone();
                    session.stalled.store(true, Ordering::Release);
                    trace!("Outbound queue of {} full, pkid {} deferred", session.id(), pkid);
                    if self.config.disconnect_slow_consumers {
                        let reason = self.on_full(state);
                        failures.push(failure(session.id(), &topic, pkid, reason));
                    }
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }

    fn on_full(&self, state: &SessionState) -> FailureReason {
        if !self.config.disconnect_slow_consumers {
            return FailureReason::QueueFull;
        }
        if let Some(link) = state.link.as_ref() {
            link.eviction.evict(EvictReason::SlowConsumer);
        }
        FailureReason::SlowConsumer
    }

    /// Move pending messages into free in-flight slots. Nothing new starts
    /// while older records still wait in the outbox.
    fn promote(
        &self,
        session: &Session,
        state: &mut SessionState,
        now: Instant,
        failures: &mut Vec<DeliveryFailure>,
    ) {
        if state.link.is_none() {
            return;
        }
        while state.outbox.is_empty() && state.inflight.len() < self.window() {
            let Some(msg) = state.pending.pop_front() else {
                break;
            };
            if !self.send_new(session, state, msg, now, failures) {
                break;
            }
        }
    }

    /// Continue a stalled session once its connection has written packets
    /// out of the channel. Cheap when the session is not stalled.
    pub fn drain_stalled(&self, session: &Session) {
        if !session.stalled.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut failures = Vec::new();
        let now = Instant::now();
        let mut state = session.state.lock();
        self.flush_outbox(session, &mut state, now, &mut failures);
        self.promote(session, &mut state, now, &mut failures);
        drop(state);
        self.report(failures);
    }

    /// Handle PUBACK. Returns false for an unknown packet id.
    pub fn puback(&self, session: &Session, pkid: u16) -> bool {
        self.complete(session, pkid, AckState::AwaitingPubAck)
    }

    /// Handle PUBCOMP. Returns false for an unknown packet id.
    pub fn pubcomp(&self, session: &Session, pkid: u16) -> bool {
        self.complete(session, pkid, AckState::AwaitingPubComp)
    }

    fn complete(&self, session: &Session, pkid: u16, expected: AckState) -> bool {
        let mut failures = Vec::new();
        let now = Instant::now();
        let mut state = session.state.lock();
        let known = state
            .inflight
            .get(&pkid)
            .is_some_and(|record| record.state == expected);
        if known {
            state.inflight.remove(&pkid);
            state.outbox.retain(|p| *p != pkid);
            self.flush_outbox(session, &mut state, now, &mut failures);
            self.promote(session, &mut state, now, &mut failures);
        } else {
            debug!("Unexpected {:?} ack for pkid {} from {}", expected, pkid, session.id());
        }
        drop(state);
        self.report(failures);
        known
    }

    /// Handle PUBREC: the delivery moves on to PUBREL / PUBCOMP.
    ///
    /// The caller answers with PUBREL whether or not the id is known.
    pub fn pubrec(&self, session: &Session, pkid: u16) -> bool {
        let mut state = session.state.lock();
        match state.inflight.get_mut(&pkid) {
            Some(record) if record.state == AckState::AwaitingPubRec => {
                record.state = AckState::AwaitingPubComp;
                record.attempts = 0;
                record.last_sent = Instant::now();
                true
            }
            Some(record) => record.state == AckState::AwaitingPubComp,
            None => false,
        }
    }

    /// Resend in-flight deliveries and promote queued messages after a
    /// persistent session reconnects.
    ///
    /// Records sent on an earlier connection go first (with DUP set),
    /// followed by the ones that never left the outbox.
    pub fn resume(&self, session: &Session) {
        let mut failures = Vec::new();
        let now = Instant::now();
        let mut state = session.state.lock();

        let unsent: Vec<u16> = state.outbox.drain(..).collect();
        let resend: Vec<u16> = state
            .inflight
            .keys()
            .copied()
            .filter(|pkid| !unsent.contains(pkid))
            .collect();
        if !resend.is_empty() {
            debug!("Resending {} in-flight messages to {}", resend.len(), session.id());
        }
        state.outbox.extend(resend);
        state.outbox.extend(unsent);

        self.flush_outbox(session, &mut state, now, &mut failures);
        self.promote(session, &mut state, now, &mut failures);
        drop(state);
        self.report(failures);
    }

    /// Redeliver every expired in-flight delivery of connected sessions and
    /// abandon the ones out of retries.
    pub fn retry_expired(&self, now: Instant) {
        let mut failures = Vec::new();

        for session in self.registry.sessions() {
            let mut guard = session.state.lock();
            let Some(tx) = guard.sender() else {
                continue;
            };
            let state: &mut SessionState = &mut guard;
            self.flush_outbox(&session, state, now, &mut failures);

            let mut blocked = !state.outbox.is_empty();
            let mut deferred = Vec::new();
            let mut exhausted = Vec::new();
            for (pkid, record) in state.inflight.iter_mut() {
                if !record.sent || state.outbox.contains(pkid) {
                    continue;
                }
                if now.saturating_duration_since(record.last_sent) < self.config.retry_interval {
                    continue;
                }
                if record.attempts >= self.config.max_retries {
                    exhausted.push(*pkid);
                    continue;
                }
                record.attempts += 1;
                record.last_sent = now;
                trace!(
                    "Redelivering pkid {} to {} (attempt {})",
                    pkid,
                    session.id(),
                    record.attempts
                );
                if blocked || matches!(tx.try_send(record.packet(true)), Err(TrySendError::Full(_))) {
                    blocked = true;
                    deferred.push(*pkid);
                }
            }
            if !deferred.is_empty() {
                session.stalled.store(true, Ordering::Release);
                state.outbox.extend(deferred);
            }

            for pkid in exhausted {
                if let Some(record) = state.inflight.remove(&pkid) {
                    failures.push(failure(
                        session.id(),
                        &record.message.topic,
                        pkid,
                        FailureReason::RetriesExhausted,
                    ));
                }
            }
            self.promote(&session, state, now, &mut failures);
        }

        self.report(failures);
    }

    /// Run [`retry_expired`](Self::retry_expired) every half retry interval
    /// until `shutdown` fires.
    pub async fn run_retry_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let period = (self.config.retry_interval / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                now = ticker.tick() => self.retry_expired(now),
            }
        }
        debug!("Retry loop stopped");
    }

    fn report(&self, failures: Vec<DeliveryFailure>) {
        for f in failures {
            warn!(
                "Delivery to {} failed on {} (pkid {}): {:?}",
                f.client_id, f.topic, f.pkid, f.reason
            );
            if let Some(ref on_failure) = self.on_failure {
                on_failure(&f);
            }
        }
    }
}

fn failure(client_id: &str, topic: &str, pkid: u16, reason: FailureReason) -> DeliveryFailure {
    DeliveryFailure {
        client_id: client_id.to_string(),
        topic: topic.to_string(),
        pkid,
        reason,
    }
}
