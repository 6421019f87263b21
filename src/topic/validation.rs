//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must be the whole of the final level
//! - Single-level wildcard (+) must occupy an entire level
//! - Only the first or last level of a filter may be empty

/// Upper bound on the byte length of a topic name or filter
pub const MAX_TOPIC_LENGTH: usize = 65535;

/// Validate a topic name (used for Will topics and server-side publishes)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE)
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    validate_topic_filter_with_max_length(filter, MAX_TOPIC_LENGTH)
}

/// Validate a topic filter against a configurable length limit
///
/// Topic filters:
/// - Must be at least 1 character and at most `max_length` bytes
/// - Must not contain null character
/// - Must not contain an empty level other than the first or the last
/// - `#` must be the sole content of the last level
/// - `+` must be the sole content of its level
pub fn validate_topic_filter_with_max_length(
    filter: &str,
    max_length: usize,
) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > max_length.min(MAX_TOPIC_LENGTH) {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let last = filter.split('/').count() - 1;
    for (i, level) in filter.split('/').enumerate() {
        if level.is_empty() && i != 0 && i != last {
            return Err("topic filter cannot contain empty inner levels");
        }

        if level.contains('#') && (level != "#" || i != last) {
            return Err("multi-level wildcard must be the whole last level");
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check if a topic name matches a topic filter
///
/// Exact equality always matches. Otherwise levels are walked in lock-step:
/// `#` matches the remainder (including nothing), `+` matches one level.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic == filter {
        return true;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(filter_level) = filter_levels.next() {
        if filter_level == "#" {
            return filter_levels.peek().is_none();
        }

        match topic_levels.next() {
            None => return false,
            Some(_) if filter_level == "+" => {}
            Some(topic_level) if topic_level != filter_level => return false,
            Some(_) => {}
        }
    }

    topic_levels.next().is_none()
}
