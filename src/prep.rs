//! Pragmatic stringprep profiles for JID parts and SASL credentials.
//!
//! Full RFC 3454 table support would pull in a Unicode database; what
//! stream negotiation actually needs is case folding for node and
//! domain, rejection of characters that change the meaning of a JID,
//! and rejection of control characters in credentials. Inputs that
//! pass these checks are forwarded unchanged, matching servers'
//! observed behavior for the ASCII-dominated identifier space.

/// Longest accepted JID part, in bytes (RFC 6122 §2.1).
const MAX_PART_LEN: usize = 1023;

fn has_control(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

/// Prepare a node (the part before `@`). Lowercases and rejects the
/// characters RFC 6122 Appendix A prohibits in nodes.
pub fn nodeprep(node: &str) -> Option<String> {
    if node.len() > MAX_PART_LEN || has_control(node) {
        return None;
    }
    if node.chars().any(|c| matches!(c, '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@' | ' ')) {
        return None;
    }
    Some(node.to_lowercase())
}

/// Prepare a domain. Lowercases; label syntax is left to the resolver.
pub fn nameprep(domain: &str) -> Option<String> {
    if domain.is_empty() || domain.len() > MAX_PART_LEN || has_control(domain) || domain.contains(' ') {
        return None;
    }
    Some(domain.to_lowercase())
}

/// Prepare a resource. Case-preserving; only controls are rejected.
pub fn resourceprep(resource: &str) -> Option<String> {
    if resource.len() > MAX_PART_LEN || has_control(resource) {
        return None;
    }
    Some(resource.to_string())
}

/// SASLprep (RFC 4013) as applied to authentication ids and passwords:
/// map non-ASCII space to space, reject controls, pass the rest.
pub fn saslprep(s: &str) -> Option<String> {
    if has_control(s) {
        return None;
    }
    Some(s.chars().map(|c| if c.is_whitespace() { ' ' } else { c }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodeprep_lowercases() {
        assert_eq!(nodeprep("Romeo").as_deref(), Some("romeo"));
    }

    #[test]
    fn test_nodeprep_rejects_prohibited() {
        assert!(nodeprep("ro@meo").is_none());
        assert!(nodeprep("ro meo").is_none());
        assert!(nodeprep("ro/meo").is_none());
    }

    #[test]
    fn test_resourceprep_preserves_case() {
        assert_eq!(resourceprep("Orchard").as_deref(), Some("Orchard"));
        assert!(resourceprep("bad\u{0007}bell").is_none());
    }

    #[test]
    fn test_saslprep_maps_spaces_and_rejects_controls() {
        assert_eq!(saslprep("pa\u{00a0}ss").as_deref(), Some("pa ss"));
        assert!(saslprep("pa\u{0000}ss").is_none());
        assert_eq!(saslprep("pencil").as_deref(), Some("pencil"));
    }
}
