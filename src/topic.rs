//! MQTT topic filter matching.

/// Check whether `topic` matches the subscription `pattern`.
///
/// `+` matches exactly one level. `#` matches every remaining level,
/// including none, and is only honoured as the last level of the pattern.
pub fn matches(topic: &str, pattern: &str) -> bool {
    let topic_parts: Vec<&str> = topic.split('/').collect();
    let pattern_parts: Vec<&str> = pattern.split('/').collect();

    match_parts(&pattern_parts, &topic_parts)
}

fn match_parts(pattern_parts: &[&str], topic_parts: &[&str]) -> bool {
    match pattern_parts.split_first() {
        None => topic_parts.is_empty(),
        Some((&"#", rest)) => rest.is_empty(),
        Some((&pattern_head, pattern_rest)) => match topic_parts.split_first() {
            None => false,
            Some((&topic_head, topic_rest)) => {
                (pattern_head == "+" || pattern_head == topic_head)
                    && match_parts(pattern_rest, topic_rest)
            }
        },
    }
}
