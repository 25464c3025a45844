//! `$SYS` client lifecycle events.
//!
//! - `$SYS/brokers/{clientid}/connected`
//! - `$SYS/brokers/{clientid}/disconnected`
//!
//! Payloads are JSON. Root wildcard subscriptions never see them. No event
//! is built for a client id that would not make a valid topic name.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::topic::validate_topic;
use crate::types::Message;

/// $SYS client connected event payload.
#[derive(Serialize)]
struct SysConnectedEvent<'a> {
    clientid: &'a str,
    username: &'a str,
    ipaddress: String,
    proto_ver: u8,
    keepalive: u16,
    clean_session: bool,
    connected_at: u64,
}

/// $SYS client disconnected event payload.
#[derive(Serialize)]
struct SysDisconnectedEvent<'a> {
    clientid: &'a str,
    username: &'a str,
    reason: &'a str,
    disconnected_at: u64,
}

fn event_topic(topic: String, client_id: &str) -> Option<String> {
    match validate_topic(&topic) {
        Ok(()) => Some(topic),
        Err(e) => {
            debug!("No $SYS event for client {:?}: {}", client_id, e);
            None
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Topic of the connected event for `client_id`.
pub fn connected_topic(client_id: &str) -> String {
    format!("$SYS/brokers/{}/connected", client_id)
}

/// Topic of the disconnected event for `client_id`.
pub fn disconnected_topic(client_id: &str) -> String {
    format!("$SYS/brokers/{}/disconnected", client_id)
}

/// Build the connected event.
pub fn connected_event(
    client_id: &str,
    username: &str,
    addr: SocketAddr,
    keepalive: u16,
    clean_session: bool,
) -> Option<Message> {
    let topic = event_topic(connected_topic(client_id), client_id)?;
    // serde_json keeps client-supplied strings from breaking the payload
    let event = SysConnectedEvent {
        clientid: client_id,
        username,
        ipaddress: addr.ip().to_string(),
        proto_ver: 4,
        keepalive,
        clean_session,
        connected_at: unix_now(),
    };
    match serde_json::to_vec(&event) {
        Ok(payload) => Some(Message::new(topic, Bytes::from(payload))),
        Err(e) => {
            warn!("Failed to serialize $SYS connected event for {}: {}", client_id, e);
            None
        }
    }
}

/// Build the disconnected event.
pub fn disconnected_event(client_id: &str, username: &str, reason: &str) -> Option<Message> {
    let topic = event_topic(disconnected_topic(client_id), client_id)?;
    let event = SysDisconnectedEvent {
        clientid: client_id,
        username,
        reason,
        disconnected_at: unix_now(),
    };
    match serde_json::to_vec(&event) {
        Ok(payload) => Some(Message::new(topic, Bytes::from(payload))),
        Err(e) => {
            warn!("Failed to serialize $SYS disconnected event for {}: {}", client_id, e);
            None
        }
    }
}
