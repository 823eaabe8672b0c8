//! Minimal glob support for cache-key patterns.
//!
//! The KV layer only ever needs `*` (any run of characters) and `?` (any
//! single character), matching the subset Redis' `KEYS`/`SCAN` understand.
//! Patterns are translated to anchored regexes for the in-memory backend.

use regex::Regex;

/// Translate a glob pattern into an anchored [`Regex`].
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => translated.push_str(".*"),
            '?' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    // The escape above guarantees a valid pattern.
    Regex::new(&translated).expect("glob translation produced invalid regex")
}

/// Convenience wrapper: does `candidate` match the glob `pattern`?
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob_to_regex(pattern).is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_spans_segments() {
        assert!(glob_match("cloud:list:u1:*", "cloud:list:u1:docs:full"));
        assert!(glob_match("cloud:list:u1:*", "cloud:list:u1:"));
        assert!(!glob_match("cloud:list:u1:*", "cloud:list:u2:docs"));
    }

    #[test]
    fn question_mark_is_single_char() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("a.b", "axb"));
        assert!(glob_match("k[1]*", "k[1]suffix"));
    }
}
