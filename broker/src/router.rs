//! Topic router: subscription index and retained message store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::Result;
use crate::topic::topic_matches;
use crate::trie::Trie;
use crate::types::{Message, QoS};

/// One session's subscription stored at a trie node.
#[derive(Debug, Clone)]
struct Subscription {
    session: Arc<str>,
    qos: QoS,
}

#[derive(Default)]
struct RouterState {
    subscriptions: Trie<Subscription>,
    retained: HashMap<String, Message>,
}

/// Subscription index and retained store.
///
/// Matching runs under a read lock, so a concurrent `subscribe` is applied
/// either entirely before or entirely after any given `matches` call.
#[derive(Default)]
pub struct TopicRouter {
    state: RwLock<RouterState>,
}

impl TopicRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `session` to `filter`. Re-subscribing replaces the granted QoS.
    pub fn subscribe(&self, session: &str, filter: &str, qos: QoS) -> Result<()> {
        let mut state = self.state.write();
        state.subscriptions.update(filter, |subs| {
            match subs.iter_mut().find(|s| s.session.as_ref() == session) {
                Some(existing) => existing.qos = qos,
                None => subs.push(Subscription {
                    session: Arc::from(session),
                    qos,
                }),
            }
        })?;
        trace!("{} subscribed to {} ({:?})", session, filter, qos);
        Ok(())
    }

    /// Remove a subscription. Returns false when it did not exist.
    pub fn unsubscribe(&self, session: &str, filter: &str) -> bool {
        let mut state = self.state.write();
        state
            .subscriptions
            .remove(filter, |s| s.session.as_ref() == session)
    }

    /// Remove every listed subscription of `session` in one critical section.
    pub fn unsubscribe_all<'a, I>(&self, session: &str, filters: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut state = self.state.write();
        for filter in filters {
            state
                .subscriptions
                .remove(filter, |s| s.session.as_ref() == session);
        }
    }

    /// Sessions subscribed to `topic`, ordered by session id.
    ///
    /// A session with several matching filters appears once with the
    /// highest granted QoS.
    pub fn matches(&self, topic: &str) -> Vec<(Arc<str>, QoS)> {
        let state = self.state.read();
        let mut merged: BTreeMap<Arc<str>, QoS> = BTreeMap::new();
        for sub in state.subscriptions.matches(topic) {
            merged
                .entry(Arc::clone(&sub.session))
                .and_modify(|qos| *qos = (*qos).max(sub.qos))
                .or_insert(sub.qos);
        }
        merged.into_iter().collect()
    }

    /// Store or replace the retained message for `topic`.
    ///
    /// An empty payload deletes the retained message.
    pub fn set_retained(&self, topic: &str, msg: Message) {
        let mut state = self.state.write();
        if msg.payload.is_empty() {
            state.retained.remove(topic);
        } else {
            state.retained.insert(topic.to_string(), msg);
        }
    }

    /// Retained messages whose topic matches `filter`, ordered by topic.
    pub fn retained(&self, filter: &str) -> Vec<Message> {
        let state = self.state.read();
        let mut messages: Vec<Message> = state
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(_, msg)| msg.clone())
            .collect();
        messages.sort_by(|a, b| a.topic.cmp(&b.topic));
        messages
    }

    /// Every retained message, for persistence.
    pub fn all_retained(&self) -> Vec<Message> {
        let state = self.state.read();
        state.retained.values().cloned().collect()
    }

    /// True when no subscription is stored.
    pub fn is_empty(&self) -> bool {
        self.state.read().subscriptions.is_empty()
    }
}
