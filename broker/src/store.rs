//! Persistence hooks for retained messages and persistent sessions.
//!
//! The broker never owns a storage backend. It reports state changes to a
//! [`Store`] and reloads from it on start. [`NoopStore`] is the default;
//! [`MemoryStore`] keeps JSON-encoded snapshots in memory, which is enough
//! for embedding and tests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Message, QoS};

/// Serializable form of a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl From<&Message> for StoredMessage {
    fn from(msg: &Message) -> Self {
        Self {
            topic: msg.topic.clone(),
            payload: msg.payload.to_vec(),
            qos: msg.qos.as_u8(),
            retain: msg.retain,
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Message {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
        }
    }
}

/// State of a persistent session while its client is offline.
///
/// Messages that were in flight are stored ahead of the pending queue and
/// are delivered again as new messages after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    /// (filter, granted QoS)
    pub subscriptions: Vec<(String, u8)>,
    pub pending: Vec<StoredMessage>,
}

/// Persistence hooks.
pub trait Store: Send + Sync {
    /// Retained messages to restore on start.
    fn load_retained(&self) -> Result<Vec<Message>>;

    /// Record a retained message; `None` deletes it.
    fn save_retained(&self, topic: &str, msg: Option<&Message>) -> Result<()>;

    /// Persistent sessions to restore on start.
    fn load_sessions(&self) -> Result<Vec<SessionSnapshot>>;

    /// Record the state of a persistent session.
    fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()>;

    /// Forget a session.
    fn remove_session(&self, client_id: &str) -> Result<()>;
}

impl fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store {{ ... }}")
    }
}

/// Store that keeps nothing.
#[derive(Debug, Default, Clone)]
pub struct NoopStore;

impl Store for NoopStore {
    fn load_retained(&self) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    fn save_retained(&self, _topic: &str, _msg: Option<&Message>) -> Result<()> {
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        Ok(Vec::new())
    }

    fn save_session(&self, _snapshot: &SessionSnapshot) -> Result<()> {
        Ok(())
    }

    fn remove_session(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryData {
    retained: HashMap<String, Vec<u8>>,
    sessions: HashMap<String, Vec<u8>>,
}

/// In-memory store backed by JSON-encoded entries.
///
/// Clones share the same data, so a test can keep a handle while the broker
/// owns another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn session_count(&self) -> usize {
        self.data.lock().sessions.len()
    }

    /// Number of stored retained messages.
    pub fn retained_count(&self) -> usize {
        self.data.lock().retained.len()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Storage(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Storage(e.to_string()))
}

impl Store for MemoryStore {
    fn load_retained(&self) -> Result<Vec<Message>> {
        let data = self.data.lock();
        data.retained
            .values()
            .map(|bytes| decode::<StoredMessage>(bytes).map(Message::from))
            .collect()
    }

    fn save_retained(&self, topic: &str, msg: Option<&Message>) -> Result<()> {
        let mut data = self.data.lock();
        match msg {
            Some(msg) => {
                let bytes = encode(&StoredMessage::from(msg))?;
                data.retained.insert(topic.to_string(), bytes);
            }
            None => {
                data.retained.remove(topic);
            }
        }
        Ok(())
    }

    fn load_sessions(&self) -> Result<Vec<SessionSnapshot>> {
        let data = self.data.lock();
        data.sessions.values().map(|bytes| decode(bytes)).collect()
    }

    fn save_session(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let bytes = encode(snapshot)?;
        self.data
            .lock()
            .sessions
            .insert(snapshot.client_id.clone(), bytes);
        Ok(())
    }

    fn remove_session(&self, client_id: &str) -> Result<()> {
        self.data.lock().sessions.remove(client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_retained() {
        let store = MemoryStore::new();
        let msg = Message::new("home/hall", "on").with_retain(true);

        store.save_retained("home/hall", Some(&msg)).unwrap();
        assert_eq!(store.load_retained().unwrap(), vec![msg]);

        store.save_retained("home/hall", None).unwrap();
        assert!(store.load_retained().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_sessions_shared_between_clones() {
        let store = MemoryStore::new();
        let handle = store.clone();

        let snapshot = SessionSnapshot {
            client_id: "gear-001".to_string(),
            subscriptions: vec![("device/+/cmd".to_string(), 1)],
            pending: vec![StoredMessage::from(
                &Message::new("device/x/cmd", "reboot").with_qos(QoS::AtLeastOnce),
            )],
        };
        store.save_session(&snapshot).unwrap();

        assert_eq!(handle.session_count(), 1);
        assert_eq!(handle.load_sessions().unwrap(), vec![snapshot]);

        handle.remove_session("gear-001").unwrap();
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_stored_message_unknown_qos() {
        let stored = StoredMessage {
            topic: "t".to_string(),
            payload: b"x".to_vec(),
            qos: 7,
            retain: false,
        };
        assert_eq!(Message::from(stored).qos, QoS::AtMostOnce);
    }
}
