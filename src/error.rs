//! Error taxonomy: connection-level outcomes, `<stream:error/>`
//! conditions, SASL failures and stanza-level errors.

use std::collections::HashMap;

use thiserror::Error;

use crate::ns;
use crate::tag::Tag;

/// Why a connection ended, or why it could not be driven further.
///
/// `NoError` is a valid state for a live connection; everything else is
/// terminal for the current stream and is handed to every registered
/// [`ConnectionListener`](crate::handler::ConnectionListener) on
/// disconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("no error")]
    NoError,
    #[error("not connected")]
    NotConnected,
    #[error("stream closed by peer")]
    StreamClosed,
    #[error("stream error received")]
    StreamError,
    #[error("server is not XMPP 1.0 compliant")]
    StreamVersionError,
    #[error("XML parse error")]
    ParseError,
    #[error("TLS negotiation or handshake failed")]
    TlsFailed,
    #[error("TLS required but not available")]
    TlsNotAvailable,
    #[error("compression negotiation failed")]
    CompressionFailed,
    #[error("I/O error")]
    IoError,
    #[error("disconnected on user request")]
    UserDisconnected,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("no supported SASL mechanism offered")]
    NoSupportedAuth,
    #[error("could not resolve server")]
    DnsError,
}

/// Defined `<stream:error/>` conditions (RFC 6120 §4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostGone,
    HostUnknown,
    ImproperAddressing,
    InternalServerError,
    InvalidFrom,
    InvalidId,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    PolicyViolation,
    RemoteConnectionFailed,
    ResourceConstraint,
    RestrictedXml,
    /// Carries the redirect target as CDATA; exposed as metadata, no
    /// automatic fail-over.
    SeeOtherHost,
    SystemShutdown,
    UndefinedCondition,
    UnsupportedEncoding,
    UnsupportedStanzaType,
    UnsupportedVersion,
    XmlNotWellFormed,
    Undefined,
}

impl StreamError {
    /// Map a condition element name to its variant. Unknown names map
    /// to `Undefined` so application-specific conditions can ride
    /// alongside a defined one.
    pub fn from_condition(name: &str) -> StreamError {
        match name {
            "bad-format" => StreamError::BadFormat,
            "bad-namespace-prefix" => StreamError::BadNamespacePrefix,
            "conflict" => StreamError::Conflict,
            "connection-timeout" => StreamError::ConnectionTimeout,
            "host-gone" => StreamError::HostGone,
            "host-unknown" => StreamError::HostUnknown,
            "improper-addressing" => StreamError::ImproperAddressing,
            "internal-server-error" => StreamError::InternalServerError,
            "invalid-from" => StreamError::InvalidFrom,
            "invalid-id" => StreamError::InvalidId,
            "invalid-namespace" => StreamError::InvalidNamespace,
            "invalid-xml" => StreamError::InvalidXml,
            "not-authorized" => StreamError::NotAuthorized,
            "policy-violation" => StreamError::PolicyViolation,
            "remote-connection-failed" => StreamError::RemoteConnectionFailed,
            "resource-constraint" => StreamError::ResourceConstraint,
            "restricted-xml" => StreamError::RestrictedXml,
            "see-other-host" => StreamError::SeeOtherHost,
            "system-shutdown" => StreamError::SystemShutdown,
            "undefined-condition" => StreamError::UndefinedCondition,
            "unsupported-encoding" => StreamError::UnsupportedEncoding,
            "unsupported-stanza-type" => StreamError::UnsupportedStanzaType,
            "unsupported-version" => StreamError::UnsupportedVersion,
            "not-well-formed" => StreamError::XmlNotWellFormed,
            _ => StreamError::Undefined,
        }
    }
}

/// A parsed `<stream:error/>`: the defined condition plus the optional
/// localized text table, application condition and `see-other-host`
/// target.
#[derive(Debug, Clone, Default)]
pub struct ParsedStreamError {
    pub error: Option<StreamError>,
    /// Localized `<text/>` children keyed by `xml:lang`; entries
    /// without a language land under `"default"`.
    pub text: HashMap<String, String>,
    /// First child in a non-stream-error namespace, kept verbatim.
    pub app_condition: Option<Tag>,
    /// CDATA of `<see-other-host/>`, when present.
    pub cdata: String,
}

impl ParsedStreamError {
    /// Classify a `<stream:error/>` element.
    pub fn parse(tag: &Tag) -> ParsedStreamError {
        let mut parsed = ParsedStreamError::default();
        for child in tag.children() {
            if child.name() == "text" {
                let lang = child.attribute("xml:lang").unwrap_or("default");
                parsed.text.insert(lang.to_string(), child.cdata().to_string());
                continue;
            }
            let condition = StreamError::from_condition(child.name());
            if condition == StreamError::Undefined {
                parsed.app_condition = Some(child.clone());
                continue;
            }
            if child.attribute("xmlns") == Some(ns::STREAM_ERROR) {
                if condition == StreamError::SeeOtherHost {
                    parsed.cdata = child.cdata().to_string();
                }
                parsed.error = Some(condition);
            }
        }
        parsed
    }

    /// Error text for the given language. Entries without a language
    /// live under `"default"` and must be asked for explicitly.
    pub fn text(&self, lang: &str) -> Option<&str> {
        self.text.get(lang).map(String::as_str)
    }
}

/// SASL `<failure/>` conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslError {
    Undefined,
    Aborted,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    MechanismTooWeak,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslError {
    /// Classify the children of a `<failure/>` element.
    pub fn from_failure(tag: &Tag) -> SaslError {
        for child in tag.children() {
            let err = match child.name() {
                "aborted" => SaslError::Aborted,
                "incorrect-encoding" => SaslError::IncorrectEncoding,
                "invalid-authzid" => SaslError::InvalidAuthzid,
                "invalid-mechanism" => SaslError::InvalidMechanism,
                "malformed-request" => SaslError::MalformedRequest,
                "mechanism-too-weak" => SaslError::MechanismTooWeak,
                "not-authorized" => SaslError::NotAuthorized,
                "temporary-auth-failure" => SaslError::TemporaryAuthFailure,
                _ => continue,
            };
            return err;
        }
        SaslError::Undefined
    }
}

/// Stanza error types (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            StanzaErrorType::Auth => "auth",
            StanzaErrorType::Cancel => "cancel",
            StanzaErrorType::Continue => "continue",
            StanzaErrorType::Modify => "modify",
            StanzaErrorType::Wait => "wait",
        }
    }

    pub fn from_str(s: &str) -> Option<StanzaErrorType> {
        Some(match s {
            "auth" => StanzaErrorType::Auth,
            "cancel" => StanzaErrorType::Cancel,
            "continue" => StanzaErrorType::Continue,
            "modify" => StanzaErrorType::Modify,
            "wait" => StanzaErrorType::Wait,
            _ => return None,
        })
    }
}

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaError {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaError {
    pub fn as_str(self) -> &'static str {
        match self {
            StanzaError::BadRequest => "bad-request",
            StanzaError::Conflict => "conflict",
            StanzaError::FeatureNotImplemented => "feature-not-implemented",
            StanzaError::Forbidden => "forbidden",
            StanzaError::Gone => "gone",
            StanzaError::InternalServerError => "internal-server-error",
            StanzaError::ItemNotFound => "item-not-found",
            StanzaError::JidMalformed => "jid-malformed",
            StanzaError::NotAcceptable => "not-acceptable",
            StanzaError::NotAllowed => "not-allowed",
            StanzaError::NotAuthorized => "not-authorized",
            StanzaError::PolicyViolation => "policy-violation",
            StanzaError::RecipientUnavailable => "recipient-unavailable",
            StanzaError::Redirect => "redirect",
            StanzaError::RegistrationRequired => "registration-required",
            StanzaError::RemoteServerNotFound => "remote-server-not-found",
            StanzaError::RemoteServerTimeout => "remote-server-timeout",
            StanzaError::ResourceConstraint => "resource-constraint",
            StanzaError::ServiceUnavailable => "service-unavailable",
            StanzaError::SubscriptionRequired => "subscription-required",
            StanzaError::UndefinedCondition => "undefined-condition",
            StanzaError::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_str(s: &str) -> Option<StanzaError> {
        Some(match s {
            "bad-request" => StanzaError::BadRequest,
            "conflict" => StanzaError::Conflict,
            "feature-not-implemented" => StanzaError::FeatureNotImplemented,
            "forbidden" => StanzaError::Forbidden,
            "gone" => StanzaError::Gone,
            "internal-server-error" => StanzaError::InternalServerError,
            "item-not-found" => StanzaError::ItemNotFound,
            "jid-malformed" => StanzaError::JidMalformed,
            "not-acceptable" => StanzaError::NotAcceptable,
            "not-allowed" => StanzaError::NotAllowed,
            "not-authorized" => StanzaError::NotAuthorized,
            "policy-violation" => StanzaError::PolicyViolation,
            "recipient-unavailable" => StanzaError::RecipientUnavailable,
            "redirect" => StanzaError::Redirect,
            "registration-required" => StanzaError::RegistrationRequired,
            "remote-server-not-found" => StanzaError::RemoteServerNotFound,
            "remote-server-timeout" => StanzaError::RemoteServerTimeout,
            "resource-constraint" => StanzaError::ResourceConstraint,
            "service-unavailable" => StanzaError::ServiceUnavailable,
            "subscription-required" => StanzaError::SubscriptionRequired,
            "undefined-condition" => StanzaError::UndefinedCondition,
            "unexpected-request" => StanzaError::UnexpectedRequest,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_classification() {
        let mut tag = Tag::new("error");
        let mut cond = Tag::new("policy-violation");
        cond.set_attribute("xmlns", ns::STREAM_ERROR);
        tag.add_child(cond);
        let mut text = Tag::new("text");
        text.set_attribute("xml:lang", "en");
        text.set_cdata("slow down");
        tag.add_child(text);

        let parsed = ParsedStreamError::parse(&tag);
        assert_eq!(parsed.error, Some(StreamError::PolicyViolation));
        assert_eq!(parsed.text("en"), Some("slow down"));
        assert_eq!(parsed.text("de"), None);
    }

    #[test]
    fn test_stream_error_without_namespace_is_ignored() {
        let mut tag = Tag::new("error");
        tag.add_child(Tag::new("conflict"));
        let parsed = ParsedStreamError::parse(&tag);
        // A condition without the RFC 6120 namespace does not classify.
        assert_eq!(parsed.error, None);
    }

    #[test]
    fn test_see_other_host_keeps_cdata() {
        let mut tag = Tag::new("error");
        let mut cond = Tag::new("see-other-host");
        cond.set_attribute("xmlns", ns::STREAM_ERROR);
        cond.set_cdata("backup.example.org:5222");
        tag.add_child(cond);
        let parsed = ParsedStreamError::parse(&tag);
        assert_eq!(parsed.error, Some(StreamError::SeeOtherHost));
        assert_eq!(parsed.cdata, "backup.example.org:5222");
    }

    #[test]
    fn test_app_condition_is_retained() {
        let mut tag = Tag::new("error");
        let mut cond = Tag::new("undefined-condition");
        cond.set_attribute("xmlns", ns::STREAM_ERROR);
        tag.add_child(cond);
        let mut app = Tag::new("pubsub-error");
        app.set_attribute("xmlns", "urn:x-app");
        tag.add_child(app);

        let parsed = ParsedStreamError::parse(&tag);
        assert_eq!(parsed.error, Some(StreamError::UndefinedCondition));
        assert_eq!(parsed.app_condition.as_ref().map(|t| t.name()), Some("pubsub-error"));
    }

    #[test]
    fn test_sasl_failure_classification() {
        let mut tag = Tag::new("failure");
        tag.add_child(Tag::new("not-authorized"));
        assert_eq!(SaslError::from_failure(&tag), SaslError::NotAuthorized);

        let empty = Tag::new("failure");
        assert_eq!(SaslError::from_failure(&empty), SaslError::Undefined);
    }

    #[test]
    fn test_stanza_error_round_trip_names() {
        assert_eq!(StanzaError::from_str("service-unavailable"), Some(StanzaError::ServiceUnavailable));
        assert_eq!(StanzaError::ServiceUnavailable.as_str(), "service-unavailable");
        assert_eq!(StanzaErrorType::from_str("cancel"), Some(StanzaErrorType::Cancel));
    }
}
