//! Error types for the broker.

use std::io;

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broker operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket could not be bound.
    #[error("address in use: {addr}")]
    AddressInUse {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Protocol error (malformed packet, violation of MQTT rules).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// CONNECT carried a protocol level other than 3.1.1.
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    /// Malformed topic filter.
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),

    /// Malformed topic name.
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),

    /// No session registered under the identifier.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Authentication failed.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Persistence hook failure.
    #[error("store error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is shutting down.
    #[error("broker shutting down")]
    ShuttingDown,
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        match e {
            rumqttc::mqttbytes::Error::InvalidProtocolLevel(level) => {
                Error::UnsupportedProtocolVersion(level)
            }
            other => Error::Protocol(other.to_string()),
        }
    }
}
