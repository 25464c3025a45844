//! Per-connection state machine.
//!
//! `Handshaking -> Connected -> Disconnecting -> Closed`
//!
//! Each accepted socket runs in its own task. The task reads packets,
//! answers acknowledgements directly and writes whatever the dispatcher
//! pushes into the connection's outbound channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::broker::BrokerContext;
use crate::error::{Error, Result};
use crate::protocol::{
    self, ConnectReturnCode, Packet, Protocol, PubAck, PubComp, PubRec, PubRel, Publish,
    SubscribeReasonCode,
};
use crate::session::{EvictReason, Eviction, Session, SessionLink};
use crate::sys;
use crate::topic::{validate_filter, validate_topic};
use crate::types::{Message, QoS};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnState {
    Handshaking,
    Connected,
    Disconnecting,
    Closed,
}

impl ConnState {
    /// States only move forward; a step back is ignored.
    fn advance(self, next: ConnState) -> ConnState {
        self.max(next)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent DISCONNECT.
    ClientDisconnect,
    /// Malformed packet or MQTT rule violation.
    ProtocolError,
    /// Nothing received within 1.5 x keep-alive.
    KeepAliveTimeout,
    /// Another connection claimed the client id.
    TakenOver,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// The broker is stopping.
    ServerShutdown,
    /// Socket closed or failed.
    ConnectionLost,
}

impl DisconnectReason {
    /// Only an explicit DISCONNECT suppresses the last will.
    pub fn is_graceful(self) -> bool {
        self == DisconnectReason::ClientDisconnect
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ClientDisconnect => "normal",
            DisconnectReason::ProtocolError => "protocol_error",
            DisconnectReason::KeepAliveTimeout => "keepalive_timeout",
            DisconnectReason::TakenOver => "takenover",
            DisconnectReason::SlowConsumer => "slow_consumer",
            DisconnectReason::ServerShutdown => "server_shutdown",
            DisconnectReason::ConnectionLost => "connection_lost",
        }
    }
}

impl From<EvictReason> for DisconnectReason {
    fn from(reason: EvictReason) -> Self {
        match reason {
            EvictReason::TakenOver => DisconnectReason::TakenOver,
            EvictReason::SlowConsumer => DisconnectReason::SlowConsumer,
        }
    }
}

enum Flow {
    Continue,
    Disconnect,
}

/// Serve one accepted socket until it closes.
///
/// `shutdown` asks the connection to disconnect and flush; `force` drops the
/// socket immediately.
pub(crate) async fn serve(
    ctx: Arc<BrokerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: CancellationToken,
    force: CancellationToken,
) {
    let mut conn = Connection::new(ctx, addr);

    let result = tokio::select! {
        result = conn.run(stream, &shutdown, &force) => result,
        _ = force.cancelled() => Err(Error::ShuttingDown),
    };

    if let Err(ref e) = result {
        debug!("Connection {} ({}) ended: {}", conn.conn_id, addr, e);
        if conn.reason.is_none() {
            conn.reason = Some(match e {
                Error::ShuttingDown => DisconnectReason::ServerShutdown,
                Error::Io(_) | Error::ConnectionClosed => DisconnectReason::ConnectionLost,
                _ => DisconnectReason::ProtocolError,
            });
        }
    }
    conn.close();
}

struct Connection {
    ctx: Arc<BrokerContext>,
    addr: SocketAddr,
    conn_id: u64,
    state: ConnState,
    client_id: String,
    username: String,
    session: Option<Arc<Session>>,
    outbound: Option<mpsc::Sender<Packet>>,
    will: Option<Message>,
    reason: Option<DisconnectReason>,
}

impl Connection {
    fn new(ctx: Arc<BrokerContext>, addr: SocketAddr) -> Self {
        let conn_id = ctx.registry.next_connection_id();
        Self {
            ctx,
            addr,
            conn_id,
            state: ConnState::Handshaking,
            client_id: String::new(),
            username: String::new(),
            session: None,
            outbound: None,
            will: None,
            reason: None,
        }
    }

    async fn run(
        &mut self,
        stream: TcpStream,
        shutdown: &CancellationToken,
        force: &CancellationToken,
    ) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        let connect_timeout = Duration::from_millis(self.ctx.config.connect_timeout_ms);
        let first = tokio::select! {
            _ = shutdown.cancelled() => return Err(Error::ShuttingDown),
            result = tokio::time::timeout(
                connect_timeout,
                protocol::read_packet(&mut reader, &mut read_buf, self.ctx.config.max_packet_size),
            ) => match result {
                Ok(packet) => packet,
                Err(_) => {
                    debug!("No CONNECT from {} within {:?}", self.addr, connect_timeout);
                    return Err(Error::Timeout("connect".to_string()));
                }
            },
        };

        let (keep_alive, mut rx, eviction) = match self.handshake(first, &mut writer).await? {
            Some(connected) => connected,
            None => return Ok(()),
        };

        let reason = self
            .client_loop(
                keep_alive,
                &mut reader,
                &mut writer,
                &mut read_buf,
                &mut rx,
                &eviction,
                shutdown,
            )
            .await;
        self.reason = Some(reason);
        self.set_state(ConnState::Disconnecting);

        if !reason.is_graceful() {
            self.publish_will();
        }

        if reason != DisconnectReason::ConnectionLost {
            self.flush(&mut writer, &mut rx, force).await;
        }
        let _ = writer.shutdown().await;
        Ok(())
    }

    /// Handle the first packet. Returns `None` when the connection was
    /// refused with a CONNACK.
    async fn handshake(
        &mut self,
        first: Result<Packet>,
        writer: &mut WriteHalf<TcpStream>,
    ) -> Result<Option<(u16, mpsc::Receiver<Packet>, Arc<Eviction>)>> {
        let connect = match first {
            Ok(Packet::Connect(connect)) => connect,
            Ok(other) => {
                return Err(Error::UnexpectedPacket {
                    expected: "CONNECT".to_string(),
                    got: protocol::packet_name(&other).to_string(),
                });
            }
            Err(Error::UnsupportedProtocolVersion(level)) => {
                warn!("Refusing {}: protocol level {}", self.addr, level);
                self.refuse(writer, ConnectReturnCode::RefusedProtocolVersion).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if connect.protocol != Protocol::V4 {
            warn!("Refusing {}: only MQTT 3.1.1 is supported", self.addr);
            self.refuse(writer, ConnectReturnCode::RefusedProtocolVersion).await?;
            return Ok(None);
        }

        let mut client_id = connect.client_id.clone();
        if client_id.is_empty() {
            if !connect.clean_session {
                warn!("Refusing {}: empty client id on a persistent session", self.addr);
                self.refuse(writer, ConnectReturnCode::BadClientId).await?;
                return Ok(None);
            }
            client_id = format!("shoepad-{}", uuid::Uuid::new_v4().simple());
        }

        let username = connect
            .login
            .as_ref()
            .map(|l| l.username.clone())
            .unwrap_or_default();
        let password = connect
            .login
            .as_ref()
            .map(|l| l.password.as_bytes())
            .unwrap_or(&[]);

        if !self.ctx.authenticator.authenticate(&client_id, &username, password) {
            warn!("Authentication failed for {}", client_id);
            self.refuse(writer, ConnectReturnCode::NotAuthorized).await?;
            return Err(Error::AuthenticationFailed);
        }

        self.will = match connect.last_will.as_ref() {
            Some(will) => match validate_topic(&will.topic) {
                Ok(()) => Some(protocol::message_from_will(will)),
                Err(e) => {
                    debug!("Ignoring will of {}: {}", client_id, e);
                    None
                }
            },
            None => None,
        };

        let (tx, rx) = mpsc::channel(self.ctx.config.outbound_queue_capacity);
        let eviction = Arc::new(Eviction::new());
        let link = SessionLink {
            conn_id: self.conn_id,
            tx: tx.downgrade(),
            eviction: Arc::clone(&eviction),
        };

        let outcome = self
            .ctx
            .registry
            .attach(&client_id, connect.clean_session, Some(link));
        if outcome.evicted_previous {
            info!("Client {} taken over by a new connection from {}", client_id, self.addr);
        }

        self.client_id = client_id;
        self.username = username;
        self.session = Some(Arc::clone(&outcome.session));
        self.set_state(ConnState::Connected);

        let connack = protocol::create_connack(outcome.session_present, ConnectReturnCode::Success);
        protocol::write_packet(writer, &connack).await?;

        // the registry only holds a weak sender
        self.outbound = Some(tx);

        if outcome.session_present {
            self.ctx.dispatcher.resume(&outcome.session);
        }

        if let Some(ref on_connect) = self.ctx.on_connect {
            on_connect(&self.client_id);
        }
        if self.ctx.config.sys_events_enabled {
            if let Some(event) = sys::connected_event(
                &self.client_id,
                &self.username,
                self.addr,
                connect.keep_alive,
                connect.clean_session,
            ) {
                self.ctx.dispatcher.publish(&event, None);
            }
        }

        info!(
            "Client {} connected from {} (clean={}, present={})",
            self.client_id, self.addr, connect.clean_session, outcome.session_present
        );
        Ok(Some((connect.keep_alive, rx, eviction)))
    }

    async fn refuse(
        &self,
        writer: &mut WriteHalf<TcpStream>,
        code: ConnectReturnCode,
    ) -> Result<()> {
        protocol::write_packet(writer, &protocol::create_connack(false, code)).await?;
        let _ = writer.shutdown().await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn client_loop(
        &self,
        keep_alive: u16,
        reader: &mut ReadHalf<TcpStream>,
        writer: &mut WriteHalf<TcpStream>,
        read_buf: &mut BytesMut,
        rx: &mut mpsc::Receiver<Packet>,
        eviction: &Eviction,
        shutdown: &CancellationToken,
    ) -> DisconnectReason {
        // Disconnect if nothing is received within 1.5 x keep_alive.
        // If keep_alive is 0, no timeout (client disabled keep-alive).
        let timeout = (keep_alive > 0).then(|| Duration::from_millis(keep_alive as u64 * 1500));
        let mut deadline = timeout.map(|t| Instant::now() + t);
        let max_packet_size = self.ctx.config.max_packet_size;

        loop {
            let current = deadline;
            let expiry = async move {
                match current {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return DisconnectReason::ServerShutdown,

                reason = eviction.evicted() => {
                    info!("Client {} evicted: {:?}", self.client_id, reason);
                    return reason.into();
                }

                _ = expiry => {
                    warn!("Client {} keep-alive timeout ({}s), disconnecting", self.client_id, keep_alive);
                    return DisconnectReason::KeepAliveTimeout;
                }

                Some(packet) = rx.recv() => {
                    if let Err(e) = protocol::write_packet(writer, &packet).await {
                        debug!("Write to {} failed: {}", self.client_id, e);
                        return DisconnectReason::ConnectionLost;
                    }
                    if let Some(ref session) = self.session {
                        self.ctx.dispatcher.drain_stalled(session);
                    }
                }

                result = protocol::read_packet(reader, read_buf, max_packet_size) => {
                    let packet = match result {
                        Ok(packet) => packet,
                        Err(Error::ConnectionClosed) | Err(Error::Io(_)) => {
                            return DisconnectReason::ConnectionLost;
                        }
                        Err(e) => {
                            warn!("Malformed packet from {}: {}", self.client_id, e);
                            return DisconnectReason::ProtocolError;
                        }
                    };

                    deadline = timeout.map(|t| Instant::now() + t);
                    trace!("{} <- {}", self.client_id, protocol::packet_name(&packet));

                    match self.handle_packet(packet, writer).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Disconnect) => return DisconnectReason::ClientDisconnect,
                        Err(Error::Io(_)) | Err(Error::ConnectionClosed) => {
                            return DisconnectReason::ConnectionLost;
                        }
                        Err(e) => {
                            warn!("Protocol violation by {}: {}", self.client_id, e);
                            return DisconnectReason::ProtocolError;
                        }
                    }
                }
            }
        }
    }

    async fn handle_packet(
        &self,
        packet: Packet,
        writer: &mut WriteHalf<TcpStream>,
    ) -> Result<Flow> {
        let Some(session) = self.session.clone() else {
            return Err(Error::Protocol("no session".to_string()));
        };
        let dispatcher = &self.ctx.dispatcher;

        match packet {
            Packet::Publish(publish) => self.handle_publish(&session, publish, writer).await?,
            Packet::PubAck(ack) => {
                dispatcher.puback(&session, ack.pkid);
            }
            Packet::PubRec(rec) => {
                dispatcher.pubrec(&session, rec.pkid);
                protocol::write_packet(writer, &Packet::PubRel(PubRel::new(rec.pkid))).await?;
            }
            Packet::PubRel(rel) => {
                session.release_incoming_qos2(rel.pkid);
                protocol::write_packet(writer, &Packet::PubComp(PubComp::new(rel.pkid))).await?;
            }
            Packet::PubComp(comp) => {
                dispatcher.pubcomp(&session, comp.pkid);
            }
            Packet::Subscribe(subscribe) => {
                let mut granted = Vec::with_capacity(subscribe.filters.len());
                let mut return_codes = Vec::with_capacity(subscribe.filters.len());

                for filter in &subscribe.filters {
                    match self.subscribe_one(&session, &filter.path, filter.qos.into()) {
                        Some(qos) => {
                            granted.push((filter.path.as_str(), qos));
                            return_codes.push(SubscribeReasonCode::Success(qos.into()));
                        }
                        None => return_codes.push(SubscribeReasonCode::Failure),
                    }
                }

                let suback = protocol::create_suback(subscribe.pkid, return_codes);
                protocol::write_packet(writer, &suback).await?;

                for (filter, qos) in granted {
                    dispatcher.deliver_retained(&session, filter, qos);
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                for filter in &unsubscribe.topics {
                    self.ctx.registry.unsubscribe(&session, filter);
                }
                debug!("Client {} unsubscribed from {:?}", self.client_id, unsubscribe.topics);
                let unsuback = protocol::create_unsuback(unsubscribe.pkid);
                protocol::write_packet(writer, &unsuback).await?;
            }
            Packet::PingReq => {
                protocol::write_packet(writer, &Packet::PingResp).await?;
            }
            Packet::Disconnect => return Ok(Flow::Disconnect),
            Packet::Connect(_) => {
                return Err(Error::Protocol("second CONNECT".to_string()));
            }
            other => {
                return Err(Error::UnexpectedPacket {
                    expected: "client packet".to_string(),
                    got: protocol::packet_name(&other).to_string(),
                });
            }
        }
        Ok(Flow::Continue)
    }

    /// Returns the granted QoS, or `None` for a refused filter.
    fn subscribe_one(&self, session: &Session, filter: &str, requested: QoS) -> Option<QoS> {
        if let Err(e) = validate_filter(filter) {
            debug!("Client {} sent invalid filter: {}", self.client_id, e);
            return None;
        }
        if !self.ctx.authenticator.authorize_subscribe(&self.client_id, filter) {
            warn!("ACL denied subscribe from {} to {}", self.client_id, filter);
            return None;
        }

        let granted = requested.min(self.ctx.config.max_qos);
        match self.ctx.registry.subscribe(session, filter, granted) {
            Ok(()) => {
                debug!("Client {} subscribed to {} ({:?})", self.client_id, filter, granted);
                Some(granted)
            }
            Err(e) => {
                debug!("Client {} subscribe to {} failed: {}", self.client_id, filter, e);
                None
            }
        }
    }

    async fn handle_publish(
        &self,
        session: &Session,
        publish: Publish,
        writer: &mut WriteHalf<TcpStream>,
    ) -> Result<()> {
        validate_topic(&publish.topic)?;
        let msg = protocol::message_from_publish(&publish);

        match msg.qos {
            QoS::AtMostOnce => self.route(msg),
            QoS::AtLeastOnce => {
                self.route(msg);
                protocol::write_packet(writer, &Packet::PubAck(PubAck::new(publish.pkid))).await?;
            }
            QoS::ExactlyOnce => {
                if session.begin_incoming_qos2(publish.pkid) {
                    self.route(msg);
                } else {
                    trace!("Duplicate QoS 2 pkid {} from {}", publish.pkid, self.client_id);
                }
                protocol::write_packet(writer, &Packet::PubRec(PubRec::new(publish.pkid))).await?;
            }
        }
        Ok(())
    }

    fn route(&self, msg: Message) {
        if !self.ctx.authenticator.authorize_publish(&self.client_id, &msg.topic) {
            warn!("ACL denied publish from {} to {}", self.client_id, msg.topic);
            return;
        }

        trace!("Client {} published to {}", self.client_id, msg.topic);

        if let Some(ref handler) = self.ctx.handler {
            handler.handle(&self.client_id, &msg);
        }
        self.ctx.dispatcher.publish(&msg, Some(&self.client_id));
    }

    fn publish_will(&mut self) {
        let Some(will) = self.will.take() else {
            return;
        };
        if !self.ctx.authenticator.authorize_publish(&self.client_id, &will.topic) {
            warn!("ACL denied will from {} to {}", self.client_id, will.topic);
            return;
        }
        debug!("Publishing will of {} to {}", self.client_id, will.topic);
        self.ctx.dispatcher.publish(&will, Some(&self.client_id));
    }

    /// Write queued outbound packets until the queue is empty, the drain
    /// timeout elapses or the broker forces the close.
    async fn flush(
        &self,
        writer: &mut WriteHalf<TcpStream>,
        rx: &mut mpsc::Receiver<Packet>,
        force: &CancellationToken,
    ) {
        let drain_timeout = Duration::from_millis(self.ctx.config.drain_timeout_ms);
        let drain = async {
            let mut flushed = 0usize;
            while let Ok(packet) = rx.try_recv() {
                protocol::write_packet(writer, &packet).await?;
                flushed += 1;
            }
            Ok::<usize, Error>(flushed)
        };

        tokio::select! {
            _ = force.cancelled() => {}
            result = tokio::time::timeout(drain_timeout, drain) => match result {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => trace!("Flushed {} packets to {}", n, self.client_id),
                Ok(Err(e)) => debug!("Flush to {} failed: {}", self.client_id, e),
                Err(_) => debug!("Drain timeout for {}", self.client_id),
            },
        }
    }

    fn set_state(&mut self, next: ConnState) {
        let next = self.state.advance(next);
        if next != self.state {
            trace!("Connection {} {:?} -> {:?}", self.conn_id, self.state, next);
            self.state = next;
        }
    }

    /// Detach the session and report the disconnect.
    fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        let reason = self.reason.unwrap_or(DisconnectReason::ConnectionLost);
        self.set_state(ConnState::Disconnecting);

        if self.session.take().is_some() {
            if !reason.is_graceful() {
                self.publish_will();
            }

            self.outbound = None;
            self.ctx
                .registry
                .detach(&self.client_id, self.conn_id, reason.is_graceful());

            if let Some(ref on_disconnect) = self.ctx.on_disconnect {
                on_disconnect(&self.client_id);
            }
            if self.ctx.config.sys_events_enabled {
                if let Some(event) =
                    sys::disconnected_event(&self.client_id, &self.username, reason.as_str())
                {
                    self.ctx.dispatcher.publish(&event, None);
                }
            }
            info!("Client {} disconnected ({})", self.client_id, reason.as_str());
        }

        self.set_state(ConnState::Closed);
    }
}
