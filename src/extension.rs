//! Typed stanza payloads and the factory that recognizes them.
//!
//! A stanza carries zero or more extensions: typed values parsed from
//! the stanza's child elements. The factory owns one parser per
//! extension type, keyed by the child's `(name, xmlns)`; stanza
//! construction asks the factory to convert every recognized child.

use std::any::Any;
use std::fmt::Debug;

use crate::error::{StanzaError, StanzaErrorType};
use crate::ns;
use crate::tag::Tag;

/// Well-known extension type ids. Application-defined extensions
/// should start at [`EXT_USER`].
pub const EXT_ERROR: i32 = 1;
pub const EXT_PING: i32 = 2;
pub const EXT_USER: i32 = 1000;

/// A typed payload attached to a stanza.
pub trait StanzaExtension: Debug + Send + Sync {
    /// Discriminator used by the IQ extension-handler registry.
    fn extension_type(&self) -> i32;

    /// Serialize back to the wire form.
    fn tag(&self) -> Tag;

    /// Downcast support for typed access on received stanzas.
    fn as_any(&self) -> &dyn Any;
}

type ParseFn = fn(&Tag) -> Option<Box<dyn StanzaExtension>>;

struct Registration {
    ext_type: i32,
    name: String,
    xmlns: String,
    parse: ParseFn,
}

/// Registry mapping child elements to extension parsers. One instance
/// per session; it owns every registration for the session's lifetime.
pub struct ExtensionFactory {
    registrations: Vec<Registration>,
}

impl ExtensionFactory {
    /// A factory pre-loaded with the extensions the engine itself
    /// needs: stanza errors and XEP-0199 ping.
    pub fn new() -> ExtensionFactory {
        let mut factory = ExtensionFactory {
            registrations: Vec::new(),
        };
        factory.register(EXT_ERROR, "error", "", ErrorExt::parse);
        factory.register(EXT_PING, "ping", ns::PING, Ping::parse);
        factory
    }

    /// Register a parser for children named `name` in `xmlns`. An
    /// empty `xmlns` matches any namespace (stanza errors carry the
    /// condition namespace on their grandchildren, not on `<error/>`).
    pub fn register(&mut self, ext_type: i32, name: &str, xmlns: &str, parse: ParseFn) {
        self.registrations.retain(|r| r.ext_type != ext_type);
        self.registrations.push(Registration {
            ext_type,
            name: name.to_string(),
            xmlns: xmlns.to_string(),
            parse,
        });
    }

    /// Remove the parser for an extension type. Returns whether one
    /// was registered.
    pub fn remove(&mut self, ext_type: i32) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.ext_type != ext_type);
        self.registrations.len() != before
    }

    /// Convert every recognized child of `tag` into its typed
    /// extension.
    pub fn extensions_for(&self, tag: &Tag) -> Vec<Box<dyn StanzaExtension>> {
        let mut out = Vec::new();
        for child in tag.children() {
            for reg in &self.registrations {
                if reg.name != child.name() {
                    continue;
                }
                if !reg.xmlns.is_empty() && child.xmlns() != Some(reg.xmlns.as_str()) {
                    continue;
                }
                if let Some(ext) = (reg.parse)(child) {
                    out.push(ext);
                    break;
                }
            }
        }
        out
    }
}

impl Default for ExtensionFactory {
    fn default() -> Self {
        ExtensionFactory::new()
    }
}

/// XEP-0199 ping payload. Carries no data; its presence is the
/// protocol.
#[derive(Debug, Clone, Default)]
pub struct Ping;

impl Ping {
    fn parse(_tag: &Tag) -> Option<Box<dyn StanzaExtension>> {
        Some(Box::new(Ping))
    }
}

impl StanzaExtension for Ping {
    fn extension_type(&self) -> i32 {
        EXT_PING
    }

    fn tag(&self) -> Tag {
        Tag::with_xmlns("ping", ns::PING)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A stanza-level `<error/>` payload (RFC 6120 §8.3).
#[derive(Debug, Clone)]
pub struct ErrorExt {
    pub error_type: StanzaErrorType,
    pub error: StanzaError,
    pub text: String,
}

impl ErrorExt {
    pub fn new(error_type: StanzaErrorType, error: StanzaError) -> ErrorExt {
        ErrorExt {
            error_type,
            error,
            text: String::new(),
        }
    }

    fn parse(tag: &Tag) -> Option<Box<dyn StanzaExtension>> {
        let error_type = tag.attribute("type").and_then(StanzaErrorType::from_str)?;
        let mut error = StanzaError::UndefinedCondition;
        let mut text = String::new();
        for child in tag.children() {
            if child.xmlns() != Some(ns::STANZAS) {
                continue;
            }
            if child.name() == "text" {
                text = child.cdata().to_string();
            } else if let Some(cond) = StanzaError::from_str(child.name()) {
                error = cond;
            }
        }
        Some(Box::new(ErrorExt {
            error_type,
            error,
            text,
        }))
    }
}

impl StanzaExtension for ErrorExt {
    fn extension_type(&self) -> i32 {
        EXT_ERROR
    }

    fn tag(&self) -> Tag {
        let mut tag = Tag::new("error");
        tag.set_attribute("type", self.error_type.as_str());
        tag.add_child(Tag::with_xmlns(self.error.as_str(), ns::STANZAS));
        if !self.text.is_empty() {
            let mut text = Tag::with_xmlns("text", ns::STANZAS);
            text.set_cdata(&self.text);
            tag.add_child(text);
        }
        tag
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe;

    impl Probe {
        fn parse(_tag: &Tag) -> Option<Box<dyn StanzaExtension>> {
            Some(Box::new(Probe))
        }
    }

    impl StanzaExtension for Probe {
        fn extension_type(&self) -> i32 {
            EXT_USER
        }
        fn tag(&self) -> Tag {
            Tag::with_xmlns("probe", "urn:x-probe")
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_factory_matches_name_and_namespace() {
        let mut factory = ExtensionFactory::new();
        factory.register(EXT_USER, "probe", "urn:x-probe", Probe::parse);

        let mut iq = Tag::new("iq");
        iq.add_child(Tag::with_xmlns("probe", "urn:x-probe"));
        iq.add_child(Tag::with_xmlns("probe", "urn:other"));

        let exts = factory.extensions_for(&iq);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].extension_type(), EXT_USER);
    }

    #[test]
    fn test_ping_recognized() {
        let factory = ExtensionFactory::new();
        let mut iq = Tag::new("iq");
        iq.add_child(Tag::with_xmlns("ping", ns::PING));
        let exts = factory.extensions_for(&iq);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].extension_type(), EXT_PING);
    }

    #[test]
    fn test_error_extension_round_trip() {
        let ext = ErrorExt::new(StanzaErrorType::Cancel, StanzaError::ServiceUnavailable);
        let tag = ext.tag();
        assert_eq!(
            tag.xml(),
            "<error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>"
        );

        let parsed = ErrorExt::parse(&tag).unwrap();
        let parsed = parsed.as_any().downcast_ref::<ErrorExt>().unwrap();
        assert_eq!(parsed.error, StanzaError::ServiceUnavailable);
        assert_eq!(parsed.error_type, StanzaErrorType::Cancel);
    }

    #[test]
    fn test_unregistered_children_yield_nothing() {
        let factory = ExtensionFactory::new();
        let mut iq = Tag::new("iq");
        iq.add_child(Tag::with_xmlns("unknown", "urn:x"));
        assert!(factory.extensions_for(&iq).is_empty());
    }

    #[test]
    fn test_remove_registration() {
        let mut factory = ExtensionFactory::new();
        assert!(factory.remove(EXT_PING));
        assert!(!factory.remove(EXT_PING));
        let mut iq = Tag::new("iq");
        iq.add_child(Tag::with_xmlns("ping", ns::PING));
        assert!(factory.extensions_for(&iq).is_empty());
    }
}
