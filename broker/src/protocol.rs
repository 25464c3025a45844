//! MQTT 3.1.1 framing on async streams.
//!
//! Packet encoding and decoding is delegated to `rumqttc::mqttbytes::v4`;
//! this module adds incremental reads, flushed writes and a few packet
//! constructors shared by the broker and its tests.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::{Message, QoS};

pub use rumqttc::mqttbytes::v4::*;
pub use rumqttc::mqttbytes::Protocol;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read a single packet from an async reader.
///
/// Bytes read past the end of the packet stay in `buf` for the next call,
/// so `buf` must be reused for the lifetime of the connection. The future is
/// cancel safe: a partially received packet is kept in `buf`.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok(packet) => return Ok(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        buf.reserve(4096);
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Write a single packet to an async writer and flush it.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size() + 5);
    packet.write(&mut buf, usize::MAX)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Short packet name for logs.
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    login: Option<(&str, &str)>,
    keep_alive: u16,
    clean_session: bool,
) -> Packet {
    let mut connect = Connect::new(client_id);
    connect.keep_alive = keep_alive;
    connect.clean_session = clean_session;
    if let Some((username, password)) = login {
        connect.set_login(username, password);
    }
    Packet::Connect(connect)
}

/// Create a CONNACK packet.
pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(code, session_present))
}

/// Create an outbound PUBLISH for `msg` at the given delivery QoS.
///
/// `pkid` is ignored for QoS 0.
pub fn create_publish(msg: &Message, qos: QoS, pkid: u16, retain: bool, dup: bool) -> Packet {
    let mut publish = Publish::from_bytes(msg.topic.as_str(), qos.into(), msg.payload.clone());
    publish.retain = retain;
    if qos != QoS::AtMostOnce {
        publish.pkid = pkid;
        publish.dup = dup;
    }
    Packet::Publish(publish)
}

/// Convert an inbound PUBLISH into a broker message.
pub fn message_from_publish(publish: &Publish) -> Message {
    Message {
        topic: publish.topic.clone(),
        payload: publish.payload.clone(),
        qos: publish.qos.into(),
        retain: publish.retain,
    }
}

/// Convert a CONNECT last will into a broker message.
pub fn message_from_will(will: &LastWill) -> Message {
    Message {
        topic: will.topic.clone(),
        payload: Bytes::clone(&will.message),
        qos: will.qos.into(),
        retain: will.retain,
    }
}

/// Create a SUBSCRIBE packet.
pub fn create_subscribe(pkid: u16, filters: &[(&str, QoS)]) -> Packet {
    let filters: Vec<SubscribeFilter> = filters
        .iter()
        .map(|(path, qos)| SubscribeFilter::new(path.to_string(), (*qos).into()))
        .collect();

    let mut subscribe = Subscribe::new_many(filters);
    subscribe.pkid = pkid;
    Packet::Subscribe(subscribe)
}

/// Create a SUBACK packet.
pub fn create_suback(pkid: u16, return_codes: Vec<SubscribeReasonCode>) -> Packet {
    Packet::SubAck(SubAck::new(pkid, return_codes))
}

/// Create an UNSUBSCRIBE packet.
pub fn create_unsubscribe(pkid: u16, topics: &[&str]) -> Packet {
    let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
    Packet::Unsubscribe(Unsubscribe { pkid, topics })
}

/// Create an UNSUBACK packet.
pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck::new(pkid))
}
