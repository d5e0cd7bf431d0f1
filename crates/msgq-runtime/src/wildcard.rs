//! Hierarchical topic-name wildcards.
//!
//! Topic names are `.`-separated token sequences. Two wildcard tokens exist:
//!
//! - `*` matches exactly one level
//! - `**` matches the current level and every remaining level; it is only
//!   legal as the final token
//!
//! Matching walks the pattern left to right without backtracking. The
//! token-count check is intentionally asymmetric: a pattern may carry one
//! token more than the topic (so `a.**` matches `a`), but a topic may only
//! carry extra tokens when the pattern contains `**`.

/// Token matching exactly one level
pub const SINGLE_LEVEL: &str = "*";

/// Token matching this level and all remaining levels
pub const MULTI_LEVEL: &str = "**";

/// Level separator in topic names
pub const SEPARATOR: char = '.';

/// Check whether `name` is a well-formed wildcard pattern.
///
/// A name containing `*` characters that does not follow the rules is not a
/// wildcard; it is matched literally.
pub fn is_wildcard(name: &str) -> bool {
    if !name.contains('*') {
        return false;
    }

    if let Some(position) = name.find(MULTI_LEVEL) {
        if position + MULTI_LEVEL.len() != name.len() {
            return false;
        }
    }

    name.split(SEPARATOR)
        .filter(|token| token.contains('*'))
        .all(|token| token == SINGLE_LEVEL || token == MULTI_LEVEL)
}

/// Match a wildcard `pattern` against a concrete `topic` name.
///
/// The pattern is assumed to be valid (see [`is_wildcard`]).
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == MULTI_LEVEL {
        return true;
    }

    let pattern_tokens: Vec<&str> = pattern.split(SEPARATOR).collect();
    let topic_tokens: Vec<&str> = topic.split(SEPARATOR).collect();
    let diff = topic_tokens.len() as isize - pattern_tokens.len() as isize;

    let has_multi_level = pattern_tokens.contains(&MULTI_LEVEL);
    if !(diff == 0 || diff == -1 || (diff > 0 && has_multi_level)) {
        return false;
    }

    for (index, pattern_token) in pattern_tokens.iter().enumerate() {
        if *pattern_token == MULTI_LEVEL {
            return true;
        }

        let Some(topic_token) = topic_tokens.get(index) else {
            return false;
        };

        if *pattern_token == SINGLE_LEVEL {
            continue;
        }

        if pattern_token != topic_token {
            return false;
        }
    }

    diff == 0
}

#[cfg(test)]
#[path = "wildcard_tests.rs"]
mod tests;
