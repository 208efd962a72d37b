//! JID parsing and the bare/full distinction.

use std::fmt;

use crate::prep;

/// A Jabber identifier: `node@domain/resource` with node and resource
/// optional. Parts are normalized on construction; an invalid part
/// leaves the corresponding field empty and the JID reports itself
/// invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Jid {
    node: String,
    domain: String,
    resource: String,
    bare: String,
    full: String,
    valid: bool,
}

impl Jid {
    /// Parse a JID of any of the forms `domain`, `node@domain`,
    /// `domain/resource`, `node@domain/resource`.
    pub fn new(jid: &str) -> Jid {
        let mut out = Jid::default();
        out.set(jid);
        out
    }

    /// Re-parse from a full string. Returns whether the JID is valid.
    pub fn set(&mut self, jid: &str) -> bool {
        self.node.clear();
        self.domain.clear();
        self.resource.clear();

        let (addr, resource) = match jid.split_once('/') {
            Some((a, r)) => (a, Some(r)),
            None => (jid, None),
        };
        let (node, domain) = match addr.split_once('@') {
            Some((n, d)) => (Some(n), d),
            None => (None, addr),
        };

        self.valid = true;
        match prep::nameprep(domain) {
            Some(d) => self.domain = d,
            None => self.valid = false,
        }
        if let Some(n) = node {
            match prep::nodeprep(n) {
                Some(n) => self.node = n,
                None => self.valid = false,
            }
        }
        if let Some(r) = resource {
            match prep::resourceprep(r) {
                Some(r) => self.resource = r,
                None => self.valid = false,
            }
        }
        self.rebuild();
        self.valid
    }

    /// Replace the resource part, e.g. after resource binding.
    pub fn set_resource(&mut self, resource: &str) -> bool {
        match prep::resourceprep(resource) {
            Some(r) => {
                self.resource = r;
                self.rebuild();
                true
            }
            None => false,
        }
    }

    fn rebuild(&mut self) {
        self.bare = if self.node.is_empty() {
            self.domain.clone()
        } else {
            format!("{}@{}", self.node, self.domain)
        };
        self.full = if self.resource.is_empty() {
            self.bare.clone()
        } else {
            format!("{}/{}", self.bare, self.resource)
        };
    }

    pub fn username(&self) -> &str {
        &self.node
    }

    pub fn server(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// `node@domain`.
    pub fn bare(&self) -> &str {
        &self.bare
    }

    /// `node@domain/resource`, or the bare form when no resource is
    /// bound.
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn is_valid(&self) -> bool {
        self.valid && !self.domain.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_empty()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full())
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Jid {
        Jid::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_jid_parses_into_parts() {
        let jid = Jid::new("romeo@example.org/balcony");
        assert_eq!(jid.username(), "romeo");
        assert_eq!(jid.server(), "example.org");
        assert_eq!(jid.resource(), "balcony");
        assert_eq!(jid.bare(), "romeo@example.org");
        assert_eq!(jid.full(), "romeo@example.org/balcony");
        assert!(jid.is_valid());
    }

    #[test]
    fn test_domain_only_jid() {
        let jid = Jid::new("example.org");
        assert_eq!(jid.bare(), "example.org");
        assert_eq!(jid.full(), "example.org");
        assert!(jid.username().is_empty());
    }

    #[test]
    fn test_case_normalization() {
        let jid = Jid::new("Romeo@Example.ORG/Balcony");
        assert_eq!(jid.bare(), "romeo@example.org");
        // Resource case is significant.
        assert_eq!(jid.resource(), "Balcony");
    }

    #[test]
    fn test_set_resource_after_bind() {
        let mut jid = Jid::new("romeo@example.org");
        assert!(jid.set_resource("orchard"));
        assert_eq!(jid.full(), "romeo@example.org/orchard");
    }

    #[test]
    fn test_invalid_node_flags_jid() {
        let jid = Jid::new("ro meo@example.org");
        assert!(!jid.is_valid());
    }
}
