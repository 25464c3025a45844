//! Minimal MQTT 3.1.1 broker.
//!
//! Accepts TCP clients, routes PUBLISH messages to matching subscriptions
//! and delivers them with QoS 0, 1 or 2. Sessions survive reconnects when
//! the client asks for a persistent session, and retained messages are
//! replayed to new subscribers.
//!
//! ## Components
//!
//! - [`TopicRouter`]: subscription index and retained messages
//! - [`SessionRegistry`]: one session per client id, takeover on reconnect
//! - [`Dispatcher`]: fan-out, in-flight windows, acknowledgements, retries
//! - [`Broker`]: listener, connection tasks, start/stop
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shoepad_broker::{Broker, BrokerConfig, Message, QoS};
//!
//! #[tokio::main]
//! async fn main() -> shoepad_broker::Result<()> {
//!     let broker = Arc::new(
//!         Broker::builder(BrokerConfig::new("0.0.0.0:1883"))
//!             .handler(|client_id: &str, msg: &Message| {
//!                 println!("{} -> {}", client_id, msg.topic);
//!             })
//!             .build(),
//!     );
//!     broker.start().await?;
//!
//!     broker.publish(Message::new("status/broker", "up").with_qos(QoS::AtLeastOnce).with_retain(true))?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     broker.stop(std::time::Duration::from_secs(2)).await;
//!     Ok(())
//! }
//! ```

mod broker;
mod connection;
mod dispatcher;
mod error;
pub mod protocol;
mod router;
mod session;
mod store;
pub mod sys;
pub mod topic;
pub mod trie;
mod types;

pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use connection::DisconnectReason;
pub use dispatcher::{
    AckState, DeliveryConfig, DeliveryFailure, DeliveryReceipt, Dispatcher, FailureReason,
};
pub use error::{Error, Result};
pub use router::TopicRouter;
pub use session::{ConnectOutcome, EvictReason, Eviction, Session, SessionLink, SessionRegistry};
pub use store::{MemoryStore, NoopStore, SessionSnapshot, Store, StoredMessage};
pub use types::{AllowAll, Authenticator, Handler, Message, QoS};

#[cfg(test)]
mod tests;
