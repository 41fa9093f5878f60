//! MQTT topic and topic-filter rules.
//!
//! - `+` matches exactly one level and must occupy a whole level.
//! - `#` matches any number of remaining levels (including none) and must be
//!   the last level.

use crate::error::BrokerError;

/// Checks that `filter` is a valid subscription filter.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidTopic`] for empty filters, NUL characters,
/// or misplaced wildcards.
pub fn validate_filter(filter: &str) -> Result<(), BrokerError> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(BrokerError::InvalidTopic(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len().saturating_sub(1);
    for (i, level) in levels.iter().enumerate() {
        let misplaced_hash = level.contains('#') && (*level != "#" || i != last);
        let misplaced_plus = level.contains('+') && *level != "+";
        if misplaced_hash || misplaced_plus {
            return Err(BrokerError::InvalidTopic(filter.to_string()));
        }
    }
    Ok(())
}

/// Checks that `topic` is a valid topic name to publish on.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidTopic`] for empty names, NUL characters or
/// wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Returns `true` if the concrete `topic` matches subscription `filter`.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
