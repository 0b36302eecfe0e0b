//! NATS-style subject matching used by the in-memory stream

/// Check if a subject matches a subscription pattern
///
/// Supports NATS wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more trailing tokens
///
/// # Examples
/// - `events.>` matches `events.rrweb.dlq`
/// - `events.*` matches `events.rrweb`
/// - `events.*` does NOT match `events.rrweb.dlq` (too many tokens)
pub fn matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        match pattern_tokens[p_idx] {
            ">" => return true,
            "*" => {}
            token if token == subject_tokens[s_idx] => {}
            _ => return false,
        }
        s_idx += 1;
        p_idx += 1;
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("events.rrweb", "events.rrweb"));
        assert!(!matches("events.rrweb", "events.other"));
        assert!(!matches("events.rrweb.dlq", "events.rrweb"));
        assert!(!matches("events", "events.rrweb"));
    }

    #[test]
    fn test_single_token_wildcard() {
        assert!(matches("events.rrweb", "events.*"));
        assert!(matches("events.rrweb.dlq", "events.*.dlq"));
        assert!(!matches("events.rrweb.dlq", "events.*"));
        assert!(matches("single", "*"));
    }

    #[test]
    fn test_tail_wildcard() {
        assert!(matches("events.rrweb", "events.>"));
        assert!(matches("events.rrweb.dlq", "events.>"));
        assert!(matches("single", ">"));
        assert!(!matches("billing.rrweb", "events.>"));
    }
}
