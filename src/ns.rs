//! XML namespace URIs used throughout stream negotiation and stanza
//! routing.

/// Default namespace of a client-to-server stream.
pub const CLIENT: &str = "jabber:client";

/// The `stream:` prefix namespace of the stream root element.
pub const STREAM: &str = "http://etherx.jabber.org/streams";

/// STARTTLS negotiation (RFC 6120 §5).
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// SASL negotiation (RFC 6120 §6).
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";

/// Stream compression negotiation (XEP-0138).
pub const COMPRESS: &str = "http://jabber.org/protocol/compress";

/// Stream compression feature announcement (XEP-0138).
pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";

/// Resource binding (RFC 6120 §7).
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

/// Session establishment (RFC 3921 §3; still announced by many servers).
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Stream-level error conditions (RFC 6120 §4.9).
pub const STREAM_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Stanza-level error conditions (RFC 6120 §8.3).
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Stream management (XEP-0198).
pub const SM: &str = "urn:xmpp:sm:3";

/// XMPP ping (XEP-0199).
pub const PING: &str = "urn:xmpp:ping";

/// Multi-user chat user payloads (XEP-0045), used for invitation
/// detection only.
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
