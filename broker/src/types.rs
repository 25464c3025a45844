//! Common types for the broker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Quality of Service level.
///
/// Serialized as its wire value (0, 1 or 2).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (PUBACK handshake).
    AtLeastOnce = 1,
    /// Exactly once delivery (PUBREC / PUBREL / PUBCOMP handshake).
    ExactlyOnce = 2,
}

impl QoS {
    /// Parse a QoS level from its wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Wire value of this level.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        QoS::from_u8(value).ok_or_else(|| format!("invalid qos {}", value))
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.as_u8()
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Requested quality of service.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Authentication and authorization for MQTT clients.
///
/// Injected through [`BrokerBuilder::authenticator`](crate::BrokerBuilder::authenticator).
/// Every method defaults to allowing the operation.
pub trait Authenticator: Send + Sync {
    /// Authenticate a client connection.
    ///
    /// Called when a client sends a CONNECT packet.
    /// Returns true to allow the connection.
    fn authenticate(&self, _client_id: &str, _username: &str, _password: &[u8]) -> bool {
        true
    }

    /// Check whether the client may publish to `topic`.
    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    /// Check whether the client may subscribe to `filter`.
    fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> bool {
        true
    }
}

/// Allow-all authenticator (default).
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl Authenticator for AllowAll {}

/// Message handler trait.
pub trait Handler: Send + Sync {
    /// Handle an incoming message.
    ///
    /// This is called for every message accepted by the broker,
    /// before it is routed to subscribers.
    fn handle(&self, client_id: &str, msg: &Message);
}

/// Function-based handler.
impl<F> Handler for F
where
    F: Fn(&str, &Message) + Send + Sync,
{
    fn handle(&self, client_id: &str, msg: &Message) {
        self(client_id, msg)
    }
}
