//! MQTT topic filter matching.
//!
//! Matching rules:
//! - `+` matches exactly one level
//! - `#` matches the remaining levels, including none (only valid last)
//! - Any other segment must be equal to the topic segment

/// Topic level separator.
pub const LEVEL_SEPARATOR: char = '/';
/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Match a pattern against a topic, both already split into levels.
///
/// Walks both sequences with a cursor pair; the grammar is deterministic
/// left to right so no backtracking is needed.
pub fn matches<P, T>(pattern: &[P], topic: &[T]) -> bool
where
    P: AsRef<str>,
    T: AsRef<str>,
{
    let (mut p, mut t) = (0, 0);

    loop {
        let Some(segment) = pattern.get(p).map(AsRef::as_ref) else {
            return t == topic.len();
        };

        if segment == MULTI_LEVEL_WILDCARD {
            return true;
        }

        let Some(level) = topic.get(t).map(AsRef::as_ref) else {
            return false;
        };

        if segment != SINGLE_LEVEL_WILDCARD && segment != level {
            return false;
        }

        p += 1;
        t += 1;
    }
}

/// Match an unsplit pattern string against an unsplit topic string.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    let pattern: Vec<&str> = pattern.split(LEVEL_SEPARATOR).collect();
    let topic: Vec<&str> = topic.split(LEVEL_SEPARATOR).collect();
    matches(&pattern, &topic)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: [&str; 0] = [];

    #[test]
    fn test_empty_pattern_matches_only_empty_topic() {
        assert!(matches(&EMPTY, &EMPTY));
        assert!(!matches(&EMPTY, &["x"]));
    }

    #[test]
    fn test_multi_level_wildcard_matches_zero_levels() {
        assert!(matches(&["#"], &EMPTY));
        assert!(matches(&["a", "#"], &["a"]));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches(&["a", "+", "c"], &["a", "b", "c"]));
        assert!(!matches(&["a", "+"], &["a", "b", "c"]));
        assert!(!matches(&["a", "+"], &["a"]));
    }

    #[test]
    fn test_multi_level_wildcard_matches_remaining() {
        assert!(matches(&["a", "#"], &["a", "b", "c", "d"]));
        assert!(matches(&["#"], &["a", "b"]));
        assert!(!matches(&["b", "#"], &["a", "b"]));
    }

    #[test]
    fn test_literal_mismatch() {
        assert!(!matches(&["a", "b"], &["a", "c"]));
        assert!(!matches(&["a", "b", "c"], &["a", "b"]));
    }

    #[test]
    fn test_empty_levels_are_distinct() {
        assert!(pattern_matches("a//c", "a//c"));
        assert!(pattern_matches("a/+/c", "a//c"));
        assert!(!pattern_matches("a/c", "a//c"));
    }

    #[test]
    fn test_pattern_matches_strings() {
        assert!(pattern_matches("sensors/+/temperature", "sensors/kitchen/temperature"));
        assert!(!pattern_matches("sensors/+/temperature", "sensors/kitchen/humidity"));
        assert!(pattern_matches("alerts/high", "alerts/high"));
    }

    #[test]
    fn test_deep_topic_does_not_recurse() {
        let topic: Vec<String> = (0..100_000).map(|i| i.to_string()).collect();
        let pattern: Vec<&str> = topic.iter().map(|_| "+").collect();
        assert!(matches(&pattern, &topic));
    }
}
