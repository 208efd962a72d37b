//! Client-side XMPP stream engine.
//!
//! This crate implements the core of an XMPP (RFC 6120) client
//! endpoint: the stream state machine that negotiates STARTTLS, stream
//! compression (XEP-0138) and SASL over one persistent connection, the
//! byte transform chain between the socket and the XML parser, and the
//! stanza dispatch layer that routes IQ, message and presence traffic
//! to application handlers. Stream management (XEP-0198) counters and
//! the resend queue ride along, as does XEP-0199 ping.
//!
//! The transports are seams: [`connection::Connection`],
//! [`tls::TlsEngine`] and [`compression::Compressor`] are traits with
//! shipped defaults (blocking TCP, rustls, zlib) that an application
//! can replace. The engine itself never spawns a thread; one caller
//! pumps it through [`client::Client::recv`].

pub mod client;
pub mod compression;
pub mod connection;
pub mod error;
pub mod extension;
pub mod handler;
pub mod jid;
pub mod ns;
pub mod parser;
mod prep;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod tag;
pub mod tls;

pub use client::{Client, SmContext};
pub use connection::{Connection, ConnectionState, RecvStatus, TcpClientConnection};
pub use error::{ConnectionError, SaslError, StanzaError, StanzaErrorType, StreamError};
pub use jid::Jid;
pub use stanza::{Iq, IqType, Message, MessageType, Presence, PresenceType, Subscription, SubscriptionType};
pub use tag::Tag;

/// Whether and how hard to insist on transport encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Never negotiate TLS.
    Disabled,
    /// Use TLS when the server offers it.
    Optional,
    /// Abort if the server cannot provide TLS.
    Required,
}

/// Negotiation milestones reported to
/// [`handler::ConnectionListener::on_stream_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Connecting,
    Encryption,
    Compression,
    Authentication,
    ResourceBinding,
    SessionCreation,
    SmEnable,
    SmResume,
    Finished,
}

/// Traffic counters for one session, reported to
/// [`handler::StatisticsHandler`] after every send and dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub total_stanzas_sent: u32,
    pub total_stanzas_received: u32,
    pub iq_stanzas_sent: u32,
    pub iq_stanzas_received: u32,
    pub message_stanzas_sent: u32,
    pub message_stanzas_received: u32,
    pub presence_stanzas_sent: u32,
    pub presence_stanzas_received: u32,
    pub subscription_stanzas_sent: u32,
    pub subscription_stanzas_received: u32,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub encryption: bool,
    pub compression: bool,
}
