//! Topic name and topic filter rules.
//!
//! - `+` matches exactly one topic level and must occupy a whole level
//! - `#` matches the parent level and any number of remaining levels; it must
//!   occupy a whole level and be the last one
//! - Topics starting with `$` are never matched by a wildcard in the first level

use crate::error::{Error, Result};

/// Longest topic or filter the wire format can carry.
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Validate a subscription filter.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidFilter("empty filter".to_string()));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidFilter("filter too long".to_string()));
    }
    if filter.contains('\0') {
        return Err(Error::InvalidFilter(format!("{:?} contains NUL", filter)));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(Error::InvalidFilter(format!(
                "{}: # must be the last level on its own",
                filter
            )));
        }
        if level.contains('+') && level != "+" {
            return Err(Error::InvalidFilter(format!(
                "{}: + must occupy a whole level",
                filter
            )));
        }
    }

    Ok(())
}

/// Validate a topic name used in PUBLISH.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidTopic("empty topic".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidTopic("topic too long".to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::InvalidTopic(format!("{} contains wildcards", topic)));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidTopic(format!("{:?} contains NUL", topic)));
    }
    Ok(())
}

/// Check if a subscription filter matches a topic.
///
/// Both arguments are assumed valid; use [`validate_filter`] and
/// [`validate_topic`] first.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    // "#" must not match "$SYS/foo", but "$SYS/#" does
    if topic.starts_with('$') && matches!(filter_parts[0], "#" | "+") {
        return false;
    }

    let mut f_idx = 0;
    let mut t_idx = 0;

    while f_idx < filter_parts.len() {
        let f = filter_parts[f_idx];

        if f == "#" {
            // matches the parent level too: "a/#" matches "a"
            return true;
        }

        if t_idx >= topic_parts.len() {
            return false;
        }

        if f != "+" && f != topic_parts[t_idx] {
            return false;
        }

        f_idx += 1;
        t_idx += 1;
    }

    t_idx == topic_parts.len()
}
