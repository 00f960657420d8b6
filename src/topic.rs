//! Topic routing: dot-segmented routing keys matched against binding patterns.
//!
//! A pattern is a dot-separated list of words where `*` matches exactly one
//! word of the routing key and `#` matches zero or more words.
//!
//! ```
//! use topic_bus::topic;
//!
//! assert!(topic::matches("user.*", "user.created"));
//! assert!(topic::matches("user.#", "user"));
//! assert!(topic::matches("#", "audit.log.created"));
//! assert!(!topic::matches("user.*", "user.login.failed"));
//! ```

/// Wildcard matching exactly one word.
pub const ONE_WORD: &str = "*";

/// Wildcard matching zero or more words.
pub const ANY_WORDS: &str = "#";

/// Check whether `routing_key` is matched by the binding `pattern`.
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&ANY_WORDS, rest)) => {
            // `#` swallows 0..=key.len() words
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&ONE_WORD, rest)) => match key.split_first() {
            Some((_, key_rest)) => matches_words(rest, key_rest),
            None => false,
        },
        Some((word, rest)) => match key.split_first() {
            Some((first, key_rest)) => first == word && matches_words(rest, key_rest),
            None => false,
        },
    }
}

/// Validate a binding pattern. Returns a description of the problem if any.
///
/// Words may not be empty (`a..b`, trailing dots) and wildcards must occupy
/// a whole word (`a*` is rejected).
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("routing pattern is empty".to_string());
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err(format!("routing pattern `{}` has an empty word", pattern));
        }
        if word != ONE_WORD && word != ANY_WORDS && (word.contains('*') || word.contains('#')) {
            return Err(format!(
                "routing pattern `{}`: wildcard must be a whole word in `{}`",
                pattern, word
            ));
        }
    }
    Ok(())
}

/// Validate a routing key used for publishing. Wildcards are not allowed.
pub fn validate_routing_key(routing_key: &str) -> Result<(), String> {
    if routing_key.is_empty() {
        return Err("routing key is empty".to_string());
    }
    if routing_key.contains('*') || routing_key.contains('#') {
        return Err(format!("routing key `{}` contains a wildcard", routing_key));
    }
    Ok(())
}
