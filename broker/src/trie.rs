//! Trie data structure for MQTT topic filter matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! Unlike a router that stops at the first matching route, [`Trie::matches`]
//! collects the values of every filter matching a topic.

use std::collections::HashMap;
use std::fmt;

use crate::error::Result;
use crate::topic::validate_filter;

/// Trie node for MQTT topic filter matching.
pub struct TrieNode<T> {
    children: HashMap<String, TrieNode<T>>,
    match_any: Option<Box<TrieNode<T>>>, // + wildcard
    match_all: Option<Box<TrieNode<T>>>, // # wildcard
    values: Vec<T>,
}

impl<T> Default for TrieNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off the first level. `None` means there are no more levels, which
/// is different from an empty level (`"a/"` has two levels).
fn split_level(path: &str) -> (&str, Option<&str>) {
    match path.find('/') {
        None => (path, None),
        Some(idx) => (&path[..idx], Some(&path[idx + 1..])),
    }
}

impl<T> TrieNode<T> {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            match_any: None,
            match_all: None,
            values: Vec::new(),
        }
    }

    /// True when the node holds no values and no descendants.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    fn node_mut(&mut self, rest: Option<&str>) -> &mut TrieNode<T> {
        let Some(path) = rest else {
            return self;
        };
        let (first, next) = split_level(path);
        match first {
            "+" => self
                .match_any
                .get_or_insert_with(|| Box::new(TrieNode::new()))
                .node_mut(next),
            // validate_filter guarantees nothing follows #
            "#" => self.match_all.get_or_insert_with(|| Box::new(TrieNode::new())),
            _ => self
                .children
                .entry(first.to_string())
                .or_default()
                .node_mut(next),
        }
    }

    fn remove_at<F>(&mut self, rest: Option<&str>, predicate: &F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let Some(path) = rest else {
            let len_before = self.values.len();
            self.values.retain(|v| !predicate(v));
            return self.values.len() < len_before;
        };

        let (first, next) = split_level(path);
        match first {
            "+" => {
                let Some(child) = self.match_any.as_mut() else {
                    return false;
                };
                let removed = child.remove_at(next, predicate);
                if child.is_empty() {
                    self.match_any = None;
                }
                removed
            }
            "#" => {
                let Some(child) = self.match_all.as_mut() else {
                    return false;
                };
                let removed = child.remove_at(None, predicate);
                if child.is_empty() {
                    self.match_all = None;
                }
                removed
            }
            _ => {
                let Some(child) = self.children.get_mut(first) else {
                    return false;
                };
                let removed = child.remove_at(next, predicate);
                if child.is_empty() {
                    self.children.remove(first);
                }
                removed
            }
        }
    }

    /// `at_root` tracks whether we're at the root level for $ topic handling.
    fn collect<'a>(&'a self, rest: Option<&str>, at_root: bool, out: &mut Vec<&'a T>) {
        let Some(topic) = rest else {
            out.extend(self.values.iter());
            // "a/#" also matches "a"
            if let Some(ref match_all) = self.match_all {
                out.extend(match_all.values.iter());
            }
            return;
        };

        let (first, next) = split_level(topic);

        if let Some(child) = self.children.get(first) {
            child.collect(next, false, out);
        }

        // $ topics only match explicit $ filters at root level
        if at_root && first.starts_with('$') {
            return;
        }

        if let Some(ref match_any) = self.match_any {
            match_any.collect(next, false, out);
        }

        if let Some(ref match_all) = self.match_all {
            out.extend(match_all.values.iter());
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for TrieNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieNode")
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("match_any", &self.match_any.is_some())
            .field("match_all", &self.match_all.is_some())
            .field("values", &self.values.len())
            .finish()
    }
}

/// Trie for MQTT topic filter matching.
///
/// Not synchronized; the owner wraps it in a lock.
pub struct Trie<T> {
    root: TrieNode<T>,
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Trie<T> {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Insert a value at the given filter.
    pub fn insert(&mut self, filter: &str, value: T) -> Result<()> {
        self.update(filter, |values| values.push(value))
    }

    /// Update values at the given filter using a callback.
    ///
    /// The callback receives a mutable reference to the values vector
    /// and can modify it in place. Fails if the filter is malformed.
    pub fn update<F>(&mut self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<T>),
    {
        validate_filter(filter)?;
        f(&mut self.root.node_mut(Some(filter)).values);
        Ok(())
    }

    /// Remove values matching the predicate from the given filter.
    ///
    /// Nodes left empty are pruned. Returns true if anything was removed.
    pub fn remove<F>(&mut self, filter: &str, predicate: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        if filter.is_empty() {
            return false;
        }
        self.root.remove_at(Some(filter), &predicate)
    }

    /// Values of every filter matching the topic.
    pub fn matches(&self, topic: &str) -> Vec<&T> {
        let mut out = Vec::new();
        if !topic.is_empty() {
            self.root.collect(Some(topic), true, &mut out);
        }
        out
    }

    /// True when no filter is stored.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<T: fmt::Debug> fmt::Debug for Trie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root)
    }
}
