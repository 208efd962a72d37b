//! The session core: stream negotiation, the transform chain routing,
//! stanza dispatch and stream management.
//!
//! One `Client` owns the connection, the optional TLS and compression
//! engines, the parser, the handler registry and all negotiation
//! state. The caller pumps it:
//!
//! ```no_run
//! use fluux_xmpp::{Client, Jid};
//!
//! let mut client = Client::new(Jid::new("romeo@example.org"), "secret");
//! client.connect(false).unwrap();
//! loop {
//!     if client.recv(Some(std::time::Duration::from_secs(1))).is_err() {
//!         break;
//!     }
//! }
//! ```
//!
//! Negotiation flow on a fresh stream: header → features → STARTTLS →
//! header → features → (compression →  header →) SASL → header →
//! features → bind → session → stream management. Every stage that
//! changes the transform chain or the authentication state re-opens
//! the stream with a fresh header and a reset parser.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, warn};

use crate::compression::{Compressor, ZlibCompressor};
use crate::connection::{Connection, ConnectionState, RecvStatus, TcpClientConnection};
use crate::error::{ConnectionError, ParsedStreamError, SaslError, StanzaError, StanzaErrorType};
use crate::extension::{ErrorExt, ExtensionFactory, Ping, StanzaExtension, EXT_PING};
use crate::handler::{
    ConnectionListener, HandlerRegistry, IqHandler, MessageHandler, MucInvitation, PresenceHandler,
    StatisticsHandler, SubscriptionHandler, TagHandler,
};
use crate::jid::Jid;
use crate::ns;
use crate::parser::{Node, StreamParser};
use crate::sasl::{Credentials, MechanismSet, SaslContext, SaslMechanism};
use crate::session::MessageSession;
use crate::stanza::{Iq, IqType, Message, Presence, Subscription, SubscriptionType};
use crate::tag::Tag;
use crate::tls::{CertInfo, TlsEngine};
use crate::{Statistics, StreamEvent, TlsPolicy};

const XMPP_STREAM_VERSION_MAJOR: i32 = 1;
const DEFAULT_PORT: u16 = 5222;

/// Stream-management negotiation state. Ordered so that "counting is
/// live" is `>= Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SmContext {
    Invalid,
    Failed,
    Requested,
    Enabled,
    Resumed,
}

/// Stream features the server offered, kept until the negotiation step
/// they drive has completed.
#[derive(Debug, Clone, Copy, Default)]
struct Features {
    starttls: bool,
    zlib: bool,
    bind: bool,
    session: bool,
    sm: bool,
}

/// The client-side XMPP session core.
pub struct Client {
    jid: Jid,
    authcid: String,
    authzid: String,
    password: String,
    server: String,
    port: u16,
    namespace: String,
    xmllang: String,
    client_key: String,
    client_certs: String,
    ca_certs: Vec<String>,

    tls_policy: TlsPolicy,
    sasl_enabled: bool,
    compress_enabled: bool,
    allowed_mechs: MechanismSet,

    connection: Option<Box<dyn Connection>>,
    encryption: Option<Box<dyn TlsEngine>>,
    compression: Option<Box<dyn Compressor>>,
    encryption_active: bool,
    compression_active: bool,
    tls_handshaking: bool,

    parser: StreamParser,
    factory: ExtensionFactory,
    registry: HandlerRegistry,
    presence_extensions: Vec<Box<dyn StanzaExtension>>,

    stream_id: String,
    authed: bool,
    resource_bound: bool,
    available_mechs: MechanismSet,
    sasl: SaslContext,
    auth_error: Option<SaslError>,
    stream_error: Option<ParsedStreamError>,
    bind_id: String,
    session_iq_id: String,
    pending_features: Features,

    sm_wanted: bool,
    sm_resume_wanted: bool,
    sm_context: SmContext,
    sm_id: String,
    sm_resume: bool,
    sm_handled: u32,
    sm_queue: Mutex<SmQueue>,

    unique_base_id: String,
    next_id: AtomicU32,
    rng: StdRng,

    stats: Statistics,
}

#[derive(Default)]
struct SmQueue {
    sent: u32,
    queue: BTreeMap<u32, Tag>,
}

impl Client {
    /// Create a session core for the given account. The server host
    /// defaults to the JID domain on port 5222.
    pub fn new(jid: Jid, password: &str) -> Client {
        let server = jid.server().to_string();
        let mut rng = StdRng::from_entropy();

        let mut sha = Sha1::new();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        sha.update(now.to_string().as_bytes());
        sha.update(rng.next_u32().to_string().as_bytes());
        let unique_base_id = hex::encode(sha.finalize());

        Client {
            jid,
            authcid: String::new(),
            authzid: String::new(),
            password: password.to_string(),
            server,
            port: DEFAULT_PORT,
            namespace: ns::CLIENT.to_string(),
            xmllang: "en".to_string(),
            client_key: String::new(),
            client_certs: String::new(),
            ca_certs: Vec::new(),
            tls_policy: TlsPolicy::Optional,
            sasl_enabled: true,
            compress_enabled: true,
            allowed_mechs: MechanismSet::ALL,
            connection: None,
            encryption: None,
            compression: None,
            encryption_active: false,
            compression_active: false,
            tls_handshaking: false,
            parser: StreamParser::new(),
            factory: ExtensionFactory::new(),
            registry: HandlerRegistry::new(),
            presence_extensions: Vec::new(),
            stream_id: String::new(),
            authed: false,
            resource_bound: false,
            available_mechs: MechanismSet::empty(),
            sasl: SaslContext::new(),
            auth_error: None,
            stream_error: None,
            bind_id: String::new(),
            session_iq_id: String::new(),
            pending_features: Features::default(),
            sm_wanted: false,
            sm_resume_wanted: false,
            sm_context: SmContext::Invalid,
            sm_id: String::new(),
            sm_resume: false,
            sm_handled: 0,
            sm_queue: Mutex::new(SmQueue::default()),
            unique_base_id,
            next_id: AtomicU32::new(0),
            rng,
            stats: Statistics::default(),
        }
    }

    // --- configuration ---

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn set_server(&mut self, server: &str, port: u16) {
        self.server = server.to_string();
        self.port = port;
    }

    pub fn set_tls_policy(&mut self, policy: TlsPolicy) {
        self.tls_policy = policy;
    }

    pub fn set_sasl(&mut self, enabled: bool) {
        self.sasl_enabled = enabled;
    }

    pub fn set_compression(&mut self, enabled: bool) {
        self.compress_enabled = enabled;
    }

    /// Restrict the SASL mechanisms the client will consider.
    pub fn set_allowed_mechanisms(&mut self, mechs: MechanismSet) {
        self.allowed_mechs = mechs;
    }

    pub fn set_authcid(&mut self, authcid: &str) {
        self.authcid = authcid.to_string();
    }

    pub fn set_authzid(&mut self, authzid: &Jid) {
        self.authzid = authzid.bare().to_string();
    }

    pub fn set_password(&mut self, password: &str) {
        self.password = password.to_string();
    }

    pub fn set_xml_lang(&mut self, lang: &str) {
        self.xmllang = lang.to_string();
    }

    pub fn set_client_cert(&mut self, client_key: &str, client_certs: &str) {
        self.client_key = client_key.to_string();
        self.client_certs = client_certs.to_string();
    }

    pub fn set_ca_certs(&mut self, ca_certs: Vec<String>) {
        self.ca_certs = ca_certs;
    }

    /// Ask for XEP-0198 stream management once a session is live.
    pub fn set_stream_management(&mut self, enable: bool, resume: bool) {
        self.sm_wanted = enable;
        self.sm_resume_wanted = resume;
    }

    /// Replace the transport. The previous one is released.
    pub fn set_connection(&mut self, connection: Box<dyn Connection>) {
        self.connection = Some(connection);
    }

    pub fn set_encryption(&mut self, encryption: Box<dyn TlsEngine>) {
        self.encryption = Some(encryption);
    }

    pub fn set_compression_impl(&mut self, compression: Box<dyn Compressor>) {
        self.compression = Some(compression);
    }

    // --- registry passthrough ---

    pub fn registry(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    pub fn extension_factory(&mut self) -> &mut ExtensionFactory {
        &mut self.factory
    }

    /// Attach a payload to every outbound presence. Replaces a prior
    /// payload of the same extension type.
    pub fn add_presence_extension(&mut self, ext: Box<dyn StanzaExtension>) {
        self.remove_presence_extension(ext.extension_type());
        self.presence_extensions.push(ext);
    }

    pub fn remove_presence_extension(&mut self, ext_type: i32) -> bool {
        let before = self.presence_extensions.len();
        self.presence_extensions.retain(|e| e.extension_type() != ext_type);
        self.presence_extensions.len() != before
    }

    // --- lifecycle ---

    /// Establish the transport and open the stream. With `block` the
    /// call only returns once the connection ended.
    pub fn connect(&mut self, block: bool) -> Result<(), ConnectionError> {
        if self.server.is_empty() {
            return Err(ConnectionError::DnsError);
        }

        if self.connection.is_none() {
            self.connection = Some(Box::new(TcpClientConnection::new(&self.server, self.port)));
        }
        if self.state() >= ConnectionState::Connecting {
            return Ok(());
        }

        if self.encryption.is_none() && self.tls_policy != TlsPolicy::Disabled {
            let mut tls = crate::tls::RustlsTls::new(&self.server);
            if tls.init(&self.client_key, &self.client_certs, &self.ca_certs) {
                self.encryption = Some(Box::new(tls));
            }
        }
        if self.compression.is_none() && self.compress_enabled {
            self.compression = Some(Box::new(ZlibCompressor::new()));
        }

        info!(server = %self.server, port = self.port, "connecting");
        self.notify_stream_event(StreamEvent::Connecting);
        if let Some(conn) = self.connection.as_mut() {
            conn.connect()?;
        }

        self.header();

        if block {
            return self.receive_loop();
        }
        Ok(())
    }

    /// Poll the transport once and process whatever arrived.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let status = match self.connection.as_mut() {
            Some(conn) if conn.state() != ConnectionState::Disconnected => conn.recv(timeout)?,
            _ => return Err(ConnectionError::NotConnected),
        };
        match status {
            RecvStatus::Idle => Ok(()),
            RecvStatus::Closed => {
                debug!("transport closed by peer");
                self.disconnect_with(ConnectionError::StreamClosed);
                Err(ConnectionError::StreamClosed)
            }
            RecvStatus::Data(bytes) => self.process_incoming(&bytes),
        }
    }

    fn receive_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.recv(Some(Duration::from_secs(1)))?;
            if self.state() == ConnectionState::Disconnected {
                return Ok(());
            }
        }
    }

    /// Close the stream and the transport on user request.
    pub fn disconnect(&mut self) {
        self.disconnect_with(ConnectionError::UserDisconnected);
    }

    fn disconnect_with(&mut self, reason: ConnectionError) {
        let connected = self
            .connection
            .as_ref()
            .map(|c| c.state() >= ConnectionState::Connecting)
            .unwrap_or(false);
        if !connected {
            return;
        }

        if reason != ConnectionError::TlsFailed {
            self.send_raw("</stream:stream>");
        }

        if let Some(conn) = self.connection.as_mut() {
            conn.disconnect();
            conn.cleanup();
        }
        if let Some(tls) = self.encryption.as_mut() {
            tls.cleanup();
        }
        if let Some(comp) = self.compression.as_mut() {
            comp.cleanup();
        }
        self.encryption_active = false;
        self.compression_active = false;
        self.tls_handshaking = false;
        self.stats.encryption = false;
        self.stats.compression = false;

        // A resumable session keeps its counters and queue so a later
        // <resume/> can replay; everything else starts over.
        let resumable = self.sm_resume && !self.sm_id.is_empty() && self.sm_context >= SmContext::Enabled;
        if !resumable {
            self.sm_context = SmContext::Invalid;
            self.sm_id.clear();
            self.sm_handled = 0;
            let mut sm = self.sm_queue.lock().unwrap();
            sm.sent = 0;
            sm.queue.clear();
        }

        self.authed = false;
        self.resource_bound = false;
        self.stream_id.clear();
        self.bind_id.clear();
        self.session_iq_id.clear();
        self.sasl = SaslContext::new();
        self.available_mechs = MechanismSet::empty();
        self.parser.reset();

        info!(reason = %reason, "disconnected");
        let listeners = self.registry.connection_listeners.clone();
        for listener in listeners {
            listener.on_disconnect(&reason);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn authed(&self) -> bool {
        self.authed
    }

    pub fn resource_bound(&self) -> bool {
        self.resource_bound
    }

    pub fn auth_error(&self) -> Option<SaslError> {
        self.auth_error
    }

    /// The last parsed `<stream:error/>`, including localized texts
    /// and the `see-other-host` target.
    pub fn stream_error(&self) -> Option<&ParsedStreamError> {
        self.stream_error.as_ref()
    }

    pub fn sm_context(&self) -> SmContext {
        self.sm_context
    }

    pub fn get_statistics(&mut self) -> Statistics {
        if let Some(conn) = self.connection.as_ref() {
            let (bytes_in, bytes_out) = conn.statistics();
            self.stats.total_bytes_received = bytes_in;
            self.stats.total_bytes_sent = bytes_out;
        }
        self.stats
    }

    // --- ids and nonces ---

    /// A session-unique stanza id: 40 hex chars of session entropy
    /// plus the request counter as 8 hex chars.
    pub fn get_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{:08x}", self.unique_base_id, n)
    }

    fn get_random(&mut self) -> String {
        let mut out = String::with_capacity(32);
        for _ in 0..4 {
            out.push_str(&format!("{:08x}", self.rng.gen::<u32>()));
        }
        out
    }

    // --- inbound chain ---

    /// Route received bytes through the active transform stages into
    /// the parser.
    fn process_incoming(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let mut plain: Vec<u8>;

        if self.encryption_active || self.tls_handshaking {
            let progress = match self.encryption.as_mut() {
                Some(tls) => match tls.decrypt(bytes) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("TLS record processing failed");
                        self.disconnect_with(ConnectionError::TlsFailed);
                        return Err(e);
                    }
                },
                None => {
                    error!("encryption active, but chain broken");
                    return Err(ConnectionError::TlsFailed);
                }
            };
            if !progress.send.is_empty() {
                if let Some(conn) = self.connection.as_mut() {
                    conn.send(&progress.send)?;
                }
            }
            if let Some(info) = progress.handshake_complete {
                if !self.finish_tls_handshake(info) {
                    return Err(ConnectionError::TlsFailed);
                }
            }
            plain = progress.plaintext;
        } else {
            plain = bytes.to_vec();
        }

        if self.compression_active && !plain.is_empty() {
            plain = match self.compression.as_mut() {
                Some(comp) => match comp.decompress(&plain) {
                    Ok(p) => p,
                    Err(e) => {
                        self.disconnect_with(ConnectionError::CompressionFailed);
                        return Err(e);
                    }
                },
                None => {
                    error!("compression active, but chain broken");
                    return Err(ConnectionError::CompressionFailed);
                }
            };
        }

        if plain.is_empty() {
            return Ok(());
        }
        self.parse(&plain)
    }

    fn parse(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let nodes = match self.parser.feed(bytes) {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "stream parse error");
                let mut err = Tag::new("stream:error");
                err.add_child(Tag::with_xmlns("restricted-xml", ns::STREAM_ERROR));
                self.send_raw(&err.xml());
                self.disconnect_with(ConnectionError::ParseError);
                return Err(ConnectionError::ParseError);
            }
        };
        for node in nodes {
            match node {
                Node::StreamOpen(tag) => self.handle_stream_open(&tag)?,
                Node::Stanza(tag) => self.handle_tag(tag)?,
                Node::StreamClose => {
                    debug!("stream closed");
                    self.disconnect_with(ConnectionError::StreamClosed);
                    return Err(ConnectionError::StreamClosed);
                }
            }
        }
        Ok(())
    }

    fn handle_stream_open(&mut self, tag: &Tag) -> Result<(), ConnectionError> {
        let version = tag.attribute("version").unwrap_or("");
        if !check_stream_version(version) {
            warn!("server is not XMPP-compliant: missing or unusable stream 'version'");
            self.disconnect_with(ConnectionError::StreamVersionError);
            return Err(ConnectionError::StreamVersionError);
        }
        self.stream_id = tag.attribute("id").unwrap_or("").to_string();
        debug!(stream_id = %self.stream_id, "stream open");
        Ok(())
    }

    // --- dispatch ---

    fn handle_tag(&mut self, tag: Tag) -> Result<(), ConnectionError> {
        debug!(stanza = %tag, "incoming");
        self.stats.total_stanzas_received += 1;

        let result = if tag.name() == "error" && tag.xmlns() == Some(ns::STREAM) {
            let parsed = ParsedStreamError::parse(&tag);
            warn!(error = ?parsed.error, "stream error received");
            self.stream_error = Some(parsed);
            self.disconnect_with(ConnectionError::StreamError);
            Err(ConnectionError::StreamError)
        } else if self.handle_normal_node(&tag)? {
            Ok(())
        } else if tag.xmlns().is_none() || tag.xmlns() == Some(self.namespace.as_str()) {
            match tag.name() {
                "iq" => {
                    let mut iq = Iq::from_tag(&tag);
                    iq.extensions = self.factory.extensions_for(&tag);
                    self.stats.iq_stanzas_received += 1;
                    self.count_handled();
                    self.notify_iq_handlers(&iq);
                    Ok(())
                }
                "message" => {
                    let mut msg = Message::from_tag(&tag);
                    msg.extensions = self.factory.extensions_for(&tag);
                    self.stats.message_stanzas_received += 1;
                    self.count_handled();
                    self.notify_message_handlers(&msg, &tag);
                    Ok(())
                }
                "presence" => {
                    if SubscriptionType::from_attr(tag.attribute("type")) != SubscriptionType::Invalid {
                        let mut sub = Subscription::from_tag(&tag);
                        sub.extensions = self.factory.extensions_for(&tag);
                        self.stats.subscription_stanzas_received += 1;
                        self.count_handled();
                        self.notify_subscription_handlers(&sub);
                    } else {
                        let mut pres = Presence::from_tag(&tag);
                        pres.extensions = self.factory.extensions_for(&tag);
                        self.stats.presence_stanzas_received += 1;
                        self.count_handled();
                        self.notify_presence_handlers(&pres);
                    }
                    Ok(())
                }
                other => {
                    warn!(name = %other, "invalid stanza received");
                    Ok(())
                }
            }
        } else {
            self.notify_tag_handlers(&tag);
            Ok(())
        };

        self.notify_statistics();
        result
    }

    fn count_handled(&mut self) {
        if self.sm_context >= SmContext::Enabled {
            self.sm_handled += 1;
        }
    }

    /// Negotiation-stanza hook. Returns whether the tag was consumed.
    fn handle_normal_node(&mut self, tag: &Tag) -> Result<bool, ConnectionError> {
        match (tag.name(), tag.xmlns()) {
            ("features", Some(ns::STREAM)) => {
                self.process_features(tag)?;
                Ok(true)
            }
            ("proceed", Some(ns::TLS)) => {
                self.start_tls_handshake()?;
                Ok(true)
            }
            ("failure", Some(ns::TLS)) => {
                warn!("server rejected STARTTLS");
                self.disconnect_with(ConnectionError::TlsFailed);
                Err(ConnectionError::TlsFailed)
            }
            ("compressed", Some(ns::COMPRESS)) => {
                self.activate_compression();
                Ok(true)
            }
            ("failure", Some(ns::COMPRESS)) => {
                warn!("server rejected compression");
                self.disconnect_with(ConnectionError::CompressionFailed);
                Err(ConnectionError::CompressionFailed)
            }
            ("challenge", Some(ns::SASL)) => {
                self.process_sasl_challenge(tag.cdata());
                Ok(true)
            }
            ("success", Some(ns::SASL)) => {
                if self.process_sasl_success(tag.cdata()) {
                    Ok(true)
                } else {
                    self.disconnect_with(ConnectionError::AuthenticationFailed);
                    Err(ConnectionError::AuthenticationFailed)
                }
            }
            ("failure", Some(ns::SASL)) => {
                let err = SaslError::from_failure(tag);
                warn!(error = ?err, "authentication failed");
                self.auth_error = Some(err);
                self.disconnect_with(ConnectionError::AuthenticationFailed);
                Err(ConnectionError::AuthenticationFailed)
            }
            ("enabled", Some(ns::SM)) => {
                self.sm_context = SmContext::Enabled;
                self.sm_id = tag.attribute("id").unwrap_or("").to_string();
                self.sm_resume = matches!(tag.attribute("resume"), Some("true") | Some("1"));
                info!(resumable = self.sm_resume, "stream management enabled");
                Ok(true)
            }
            ("resumed", Some(ns::SM)) => {
                if tag.attribute("previd") == Some(self.sm_id.as_str()) {
                    self.sm_context = SmContext::Resumed;
                    let handled = tag
                        .attribute("h")
                        .and_then(|h| h.parse::<u32>().ok())
                        .unwrap_or(0);
                    info!(handled, "stream resumed");
                    self.check_queue(handled, true);
                    self.notify_on_connect();
                }
                Ok(true)
            }
            ("failed", Some(ns::SM)) => {
                warn!("stream management request failed");
                let was_resuming = self.sm_context >= SmContext::Enabled;
                self.sm_context = SmContext::Failed;
                self.sm_id.clear();
                self.sm_handled = 0;
                {
                    let mut sm = self.sm_queue.lock().unwrap();
                    sm.sent = 0;
                    sm.queue.clear();
                }
                // A failed resumption falls back to a fresh bind.
                if was_resuming && !self.resource_bound && self.pending_features.bind {
                    self.start_bind();
                }
                Ok(true)
            }
            ("r", Some(ns::SM)) => {
                let mut ack = Tag::with_xmlns("a", ns::SM);
                ack.set_attribute("h", &self.sm_handled.to_string());
                self.send_tag(ack);
                Ok(true)
            }
            ("a", Some(ns::SM)) => {
                if let Some(handled) = tag.attribute("h").and_then(|h| h.parse::<u32>().ok()) {
                    self.check_queue(handled, false);
                }
                Ok(true)
            }
            ("iq", _) if !self.bind_id.is_empty() && tag.attribute("id") == Some(self.bind_id.as_str()) => {
                self.process_bind_result(tag);
                Ok(true)
            }
            ("iq", _)
                if !self.session_iq_id.is_empty() && tag.attribute("id") == Some(self.session_iq_id.as_str()) =>
            {
                self.process_session_result(tag);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // --- negotiation ---

    fn process_features(&mut self, features: &Tag) -> Result<(), ConnectionError> {
        let parsed = Features {
            starttls: features.find_child_ns("starttls", ns::TLS).is_some(),
            zlib: features
                .find_child_ns("compression", ns::COMPRESS_FEATURE)
                .map(|c| c.children().iter().any(|m| m.name() == "method" && m.cdata() == "zlib"))
                .unwrap_or(false),
            bind: features.find_child_ns("bind", ns::BIND).is_some(),
            session: features.find_child_ns("session", ns::SESSION).is_some(),
            sm: features.find_child_ns("sm", ns::SM).is_some(),
        };
        self.pending_features = parsed;

        self.available_mechs = MechanismSet::empty();
        if let Some(mechs) = features.find_child_ns("mechanisms", ns::SASL) {
            for mech in mechs.children() {
                if mech.name() == "mechanism" {
                    if let Some(m) = SaslMechanism::from_name(mech.cdata()) {
                        self.available_mechs.insert(m);
                    }
                }
            }
        }

        // TLS first: everything else happens on the protected stream.
        if !self.encryption_active && self.tls_policy != TlsPolicy::Disabled && self.encryption.is_some() {
            if parsed.starttls {
                self.notify_stream_event(StreamEvent::Encryption);
                self.send_tag(Tag::with_xmlns("starttls", ns::TLS));
                return Ok(());
            }
            if self.tls_policy == TlsPolicy::Required {
                warn!("TLS required, but server does not offer STARTTLS");
                self.disconnect_with(ConnectionError::TlsNotAvailable);
                return Err(ConnectionError::TlsNotAvailable);
            }
        }

        // Compression, once the transport question is settled.
        if !self.compression_active && self.compress_enabled && self.compression.is_some() && parsed.zlib {
            self.notify_stream_event(StreamEvent::Compression);
            let mut compress = Tag::with_xmlns("compress", ns::COMPRESS);
            let mut method = Tag::new("method");
            method.set_cdata("zlib");
            compress.add_child(method);
            self.send_tag(compress);
            return Ok(());
        }

        if !self.authed && self.sasl_enabled {
            if !self.available_mechs.is_empty() {
                return self.start_sasl();
            }
            if !self.password.is_empty() {
                warn!("no SASL mechanisms offered");
                self.disconnect_with(ConnectionError::NoSupportedAuth);
                return Err(ConnectionError::NoSupportedAuth);
            }
        }

        if self.authed {
            // Prefer resuming the previous session over a fresh bind.
            if self.sm_wanted && self.sm_resume && !self.sm_id.is_empty() && self.sm_context >= SmContext::Enabled {
                self.notify_stream_event(StreamEvent::SmResume);
                let mut resume = Tag::with_xmlns("resume", ns::SM);
                resume.set_attribute("h", &self.sm_handled.to_string());
                resume.set_attribute("previd", &self.sm_id);
                self.send_tag(resume);
                return Ok(());
            }
            if parsed.bind && !self.resource_bound {
                self.start_bind();
                return Ok(());
            }
        }

        Ok(())
    }

    fn select_mechanism(&self) -> Option<SaslMechanism> {
        let offered = self.available_mechs;
        let allowed = self.allowed_mechs;
        let usable = |m: SaslMechanism| offered.contains(m) && allowed.contains(m);

        let binding_available = self
            .encryption
            .as_ref()
            .map(|tls| self.encryption_active && tls.channel_binding().is_some())
            .unwrap_or(false);

        if usable(SaslMechanism::ScramSha1Plus) && binding_available {
            return Some(SaslMechanism::ScramSha1Plus);
        }
        if usable(SaslMechanism::ScramSha1) {
            return Some(SaslMechanism::ScramSha1);
        }
        if usable(SaslMechanism::DigestMd5) {
            return Some(SaslMechanism::DigestMd5);
        }
        if usable(SaslMechanism::External) && !self.client_certs.is_empty() {
            return Some(SaslMechanism::External);
        }
        if usable(SaslMechanism::Plain) {
            return Some(SaslMechanism::Plain);
        }
        if usable(SaslMechanism::Anonymous) && self.password.is_empty() {
            return Some(SaslMechanism::Anonymous);
        }
        None
    }

    fn start_sasl(&mut self) -> Result<(), ConnectionError> {
        let mechanism = match self.select_mechanism() {
            Some(m) => m,
            None => {
                warn!("none of the offered SASL mechanisms is usable");
                self.disconnect_with(ConnectionError::NoSupportedAuth);
                return Err(ConnectionError::NoSupportedAuth);
            }
        };
        info!(mechanism = mechanism.name(), "starting authentication");
        self.notify_stream_event(StreamEvent::Authentication);

        let creds = self.credentials();
        let nonce = self.get_random();
        let binding_type = self
            .encryption
            .as_ref()
            .map(|tls| tls.channel_binding_type())
            .unwrap_or("");
        let payload = self.sasl.client_first(
            mechanism,
            &creds,
            &nonce,
            self.available_mechs.contains(SaslMechanism::ScramSha1Plus),
            binding_type,
        );

        let mut auth = Tag::with_xmlns("auth", ns::SASL);
        auth.set_attribute("mechanism", mechanism.name());
        if let Some(payload) = payload {
            auth.set_cdata(&payload);
        }
        self.send_tag(auth);
        Ok(())
    }

    fn credentials(&self) -> Credentials {
        Credentials {
            authcid: self.authcid.clone(),
            authzid: self.authzid.clone(),
            password: self.password.clone(),
            domain: self.jid.server().to_string(),
            username: self.jid.username().to_string(),
        }
    }

    fn process_sasl_challenge(&mut self, challenge_b64: &str) {
        let decoded = match BASE64_STANDARD.decode(challenge_b64.trim()) {
            Ok(d) => d,
            Err(_) => {
                warn!("undecodable SASL challenge");
                Vec::new()
            }
        };
        let creds = self.credentials();
        let cnonce = self.get_random();
        let binding = self
            .encryption
            .as_ref()
            .and_then(|tls| tls.channel_binding())
            .unwrap_or_default();
        let response = self.sasl.challenge(&decoded, &creds, &cnonce, &binding);

        let mut tag = Tag::with_xmlns("response", ns::SASL);
        if !response.is_empty() {
            tag.set_cdata(&response);
        }
        self.send_tag(tag);
    }

    fn process_sasl_success(&mut self, payload: &str) -> bool {
        if !self.sasl.verify_success(payload.trim()) {
            error!("SASL success verification failed: server signature mismatch");
            return false;
        }
        info!("authentication successful");
        self.authed = true;
        self.reopen_stream();
        true
    }

    fn start_tls_handshake(&mut self) -> Result<(), ConnectionError> {
        if self.encryption_active || self.tls_handshaking {
            debug!("ignoring redundant <proceed/>");
            return Ok(());
        }
        let hello = match self.encryption.as_mut() {
            Some(tls) => tls.handshake(),
            None => {
                error!("server sent <proceed/>, but no TLS engine is set");
                self.disconnect_with(ConnectionError::TlsFailed);
                return Err(ConnectionError::TlsFailed);
            }
        };
        match hello {
            Ok(bytes) => {
                self.tls_handshaking = true;
                if let Some(conn) = self.connection.as_mut() {
                    conn.send(&bytes)?;
                }
                Ok(())
            }
            Err(e) => {
                self.disconnect_with(ConnectionError::TlsFailed);
                Err(e)
            }
        }
    }

    fn finish_tls_handshake(&mut self, info: CertInfo) -> bool {
        self.tls_handshaking = false;

        let listeners = self.registry.connection_listeners.clone();
        let accepted = listeners.iter().all(|l| l.on_tls_connect(&info));
        if !accepted {
            error!("server certificate rejected by listener");
            self.disconnect_with(ConnectionError::TlsFailed);
            return false;
        }

        info!(protocol = %info.protocol, cipher = %info.cipher, "connection encryption active");
        self.encryption_active = true;
        self.stats.encryption = true;
        self.reopen_stream();
        true
    }

    fn activate_compression(&mut self) {
        if self.compression_active {
            debug!("ignoring redundant <compressed/>");
            return;
        }
        if let Some(comp) = self.compression.as_mut() {
            comp.cleanup();
        }
        self.compression_active = true;
        self.stats.compression = true;
        info!("stream compression active");
        self.reopen_stream();
    }

    /// Fresh prolog and stream header after a chain or authentication
    /// transition.
    fn reopen_stream(&mut self) {
        self.parser.reset();
        self.header();
    }

    fn header(&mut self) {
        let head = format!(
            "<?xml version='1.0' ?><stream:stream to='{}' xmlns='{}' xmlns:stream='{}' xml:lang='{}' version='1.0'>",
            self.jid.server(),
            self.namespace,
            ns::STREAM,
            self.xmllang
        );
        self.send_raw(&head);
    }

    fn start_bind(&mut self) {
        self.notify_stream_event(StreamEvent::ResourceBinding);
        self.bind_id = self.get_id();
        let mut iq = Iq::new(IqType::Set, Jid::default(), &self.bind_id);
        let mut bind = Tag::with_xmlns("bind", ns::BIND);
        if !self.jid.resource().is_empty() {
            let mut resource = Tag::new("resource");
            resource.set_cdata(self.jid.resource());
            bind.add_child(resource);
        }
        iq.payload = Some(bind);
        self.send_iq(iq);
    }

    fn process_bind_result(&mut self, tag: &Tag) {
        self.bind_id.clear();
        let iq = {
            let mut iq = Iq::from_tag(tag);
            iq.extensions = self.factory.extensions_for(tag);
            iq
        };
        match iq.subtype {
            IqType::Result => {
                if let Some(full) = tag
                    .find_child_ns("bind", ns::BIND)
                    .and_then(|b| b.find_child("jid"))
                    .map(|j| j.cdata().to_string())
                {
                    self.jid.set(&full);
                }
                self.resource_bound = true;
                info!(jid = %self.jid.full(), "resource bound");
                let resource = self.jid.resource().to_string();
                let listeners = self.registry.connection_listeners.clone();
                for listener in listeners {
                    listener.on_resource_bind(&resource);
                }

                if self.pending_features.session {
                    self.notify_stream_event(StreamEvent::SessionCreation);
                    self.session_iq_id = self.get_id();
                    let mut session_iq = Iq::new(IqType::Set, Jid::default(), &self.session_iq_id);
                    session_iq.payload = Some(Tag::with_xmlns("session", ns::SESSION));
                    self.send_iq(session_iq);
                } else {
                    self.finalize_negotiation();
                }
            }
            _ => {
                warn!("resource binding failed");
                let listeners = self.registry.connection_listeners.clone();
                for listener in listeners {
                    listener.on_resource_bind_error(iq.error());
                }
            }
        }
    }

    fn process_session_result(&mut self, tag: &Tag) {
        self.session_iq_id.clear();
        let iq = {
            let mut iq = Iq::from_tag(tag);
            iq.extensions = self.factory.extensions_for(tag);
            iq
        };
        match iq.subtype {
            IqType::Result => self.finalize_negotiation(),
            _ => {
                warn!("session establishment failed");
                let listeners = self.registry.connection_listeners.clone();
                for listener in listeners {
                    listener.on_session_create_error(iq.error());
                }
            }
        }
    }

    fn finalize_negotiation(&mut self) {
        if self.sm_wanted && self.pending_features.sm {
            self.notify_stream_event(StreamEvent::SmEnable);
            self.sm_context = SmContext::Requested;
            self.sm_handled = 0;
            {
                let mut sm = self.sm_queue.lock().unwrap();
                sm.sent = 0;
                sm.queue.clear();
            }
            let mut enable = Tag::with_xmlns("enable", ns::SM);
            if self.sm_resume_wanted {
                enable.set_attribute("resume", "true");
            }
            self.send_tag(enable);
        }
        self.notify_stream_event(StreamEvent::Finished);
        self.notify_on_connect();
    }

    fn notify_on_connect(&mut self) {
        let listeners = self.registry.connection_listeners.clone();
        for listener in listeners {
            listener.on_connect();
        }
    }

    fn notify_stream_event(&mut self, event: StreamEvent) {
        let listeners = self.registry.connection_listeners.clone();
        for listener in listeners {
            listener.on_stream_event(event);
        }
    }

    // --- outbound ---

    /// Send an IQ and route its `result`/`error` back to `handler`
    /// with `context`. Assigns a fresh id when none is set.
    pub fn send_iq_with_handler(&mut self, mut iq: Iq, handler: Arc<dyn IqHandler>, context: i32) {
        if iq.subtype == IqType::Get || iq.subtype == IqType::Set {
            if iq.id.is_empty() {
                iq.id = self.get_id();
            }
            self.registry.track_iq_id(&iq.id, handler, context);
        }
        self.send_iq(iq);
    }

    pub fn send_iq(&mut self, iq: Iq) {
        self.stats.iq_stanzas_sent += 1;
        let mut tag = iq.tag();
        self.add_from(&mut tag);
        self.add_namespace(&mut tag);
        self.send_stanza_tag(tag, true);
    }

    pub fn send_message(&mut self, msg: Message) {
        self.stats.message_stanzas_sent += 1;
        let mut tag = msg.tag();
        self.add_from(&mut tag);
        self.add_namespace(&mut tag);
        self.send_stanza_tag(tag, true);
    }

    pub fn send_presence(&mut self, presence: Presence) {
        self.stats.presence_stanzas_sent += 1;
        let mut tag = presence.tag();
        for ext in &self.presence_extensions {
            tag.add_child(ext.tag());
        }
        self.add_from(&mut tag);
        self.add_namespace(&mut tag);
        self.send_stanza_tag(tag, true);
    }

    pub fn send_subscription(&mut self, subscription: Subscription) {
        self.stats.subscription_stanzas_sent += 1;
        let mut tag = subscription.tag();
        self.add_from(&mut tag);
        self.add_namespace(&mut tag);
        self.send_stanza_tag(tag, true);
    }

    /// Send a raw element without stream-management queueing.
    pub fn send_tag(&mut self, tag: Tag) {
        self.send_stanza_tag(tag, false);
    }

    fn send_stanza_tag(&mut self, tag: Tag, queue: bool) {
        self.send_raw(&tag.xml());
        self.stats.total_stanzas_sent += 1;
        self.notify_statistics();

        if queue && self.sm_context >= SmContext::Enabled {
            let mut sm = self.sm_queue.lock().unwrap();
            sm.sent += 1;
            let key = sm.sent;
            sm.queue.insert(key, tag);
        }
    }

    /// The lowest outbound layer: compress, then encrypt, then write.
    fn send_raw(&mut self, xml: &str) {
        let connected = self
            .connection
            .as_ref()
            .map(|c| c.state() == ConnectionState::Connected)
            .unwrap_or(false);
        if !connected {
            return;
        }

        let mut bytes = xml.as_bytes().to_vec();
        if self.compression_active {
            bytes = match self.compression.as_mut() {
                Some(comp) => match comp.compress(&bytes) {
                    Ok(b) => b,
                    Err(_) => {
                        self.disconnect_with(ConnectionError::CompressionFailed);
                        return;
                    }
                },
                None => {
                    error!("compression active, but chain broken");
                    return;
                }
            };
        }
        if self.encryption_active {
            bytes = match self.encryption.as_mut() {
                Some(tls) => match tls.encrypt(&bytes) {
                    Ok(b) => b,
                    Err(_) => {
                        self.disconnect_with(ConnectionError::TlsFailed);
                        return;
                    }
                },
                None => {
                    error!("encryption active, but chain broken");
                    return;
                }
            };
        }
        if let Some(conn) = self.connection.as_mut() {
            if conn.send(&bytes).is_ok() {
                debug!(xml = %xml, "outgoing");
            }
        }
    }

    /// A single space, enough to keep NAT mappings warm.
    pub fn whitespace_ping(&mut self) {
        self.send_raw(" ");
    }

    /// XEP-0199 application-level ping. The optional handler receives
    /// the pong (or error) via IQ id correlation.
    pub fn xmpp_ping(&mut self, to: Jid, handler: Option<Arc<dyn IqHandler>>, context: i32) {
        let mut iq = Iq::new(IqType::Get, to, &self.get_id());
        iq.add_extension(Box::new(Ping));
        match handler {
            Some(h) => self.send_iq_with_handler(iq, h, context),
            None => self.send_iq(iq),
        }
    }

    fn add_from(&self, tag: &mut Tag) {
        if !self.authed || !self.resource_bound || tag.attribute("from").is_some() {
            return;
        }
        tag.set_attribute("from", self.jid.full());
    }

    fn add_namespace(&self, tag: &mut Tag) {
        if tag.xmlns().is_some() {
            return;
        }
        tag.set_xmlns(&self.namespace);
    }

    // --- stream management ---

    /// Ask the peer to acknowledge everything received so far.
    pub fn ack_request(&mut self) {
        if self.sm_context >= SmContext::Enabled {
            self.send_tag(Tag::with_xmlns("r", ns::SM));
        }
    }

    /// Drop queue entries the peer acknowledged (`key <= handled`);
    /// with `resend`, replay everything newer in key order. Replayed
    /// entries stay queued until acknowledged.
    pub fn check_queue(&mut self, handled: u32, resend: bool) {
        if self.sm_context < SmContext::Enabled {
            return;
        }
        let to_resend: Vec<String> = {
            let mut sm = self.sm_queue.lock().unwrap();
            sm.queue.retain(|key, _| *key > handled);
            if resend {
                sm.queue.values().map(|t| t.xml()).collect()
            } else {
                Vec::new()
            }
        };
        for xml in to_resend {
            self.send_raw(&xml);
            self.stats.total_stanzas_sent += 1;
        }
    }

    /// Snapshot of the unacknowledged outbound stanzas, oldest first.
    pub fn send_queue(&self) -> Vec<Tag> {
        let sm = self.sm_queue.lock().unwrap();
        sm.queue.values().cloned().collect()
    }

    // --- handler notification ---

    fn notify_iq_handlers(&mut self, iq: &Iq) {
        let tracked = if iq.subtype == IqType::Result || iq.subtype == IqType::Error {
            let mut map = self.registry.iq_id_handlers.lock().unwrap();
            map.remove(&iq.id)
        } else {
            None
        };
        if let Some(track) = tracked {
            track.handler.handle_iq_id(iq, track.context);
            return;
        }

        // Engine-level XEP-0199: answer pings without application help.
        if iq.subtype == IqType::Get && iq.find_extension(EXT_PING).is_some() {
            let reply = Iq::new(IqType::Result, iq.from.clone(), &iq.id);
            self.send_iq(reply);
            return;
        }

        if iq.extensions.is_empty() {
            if iq.subtype == IqType::Get || iq.subtype == IqType::Set {
                let mut reply = Iq::new(IqType::Error, iq.from.clone(), &iq.id);
                reply.add_extension(Box::new(ErrorExt::new(
                    StanzaErrorType::Cancel,
                    StanzaError::FeatureNotImplemented,
                )));
                self.send_iq(reply);
            }
            return;
        }

        let handlers: Vec<(i32, Arc<dyn IqHandler>)> = {
            let list = self.registry.iq_ext_handlers.lock().unwrap();
            list.clone()
        };
        let mut handled = false;
        'outer: for ext in &iq.extensions {
            for (ext_type, handler) in &handlers {
                if *ext_type != ext.extension_type() {
                    continue;
                }
                if handler.handle_iq(iq) {
                    handled = true;
                    break 'outer;
                }
            }
        }

        if !handled && (iq.subtype == IqType::Get || iq.subtype == IqType::Set) {
            let mut reply = Iq::new(IqType::Error, iq.from.clone(), &iq.id);
            reply.add_extension(Box::new(ErrorExt::new(
                StanzaErrorType::Cancel,
                StanzaError::ServiceUnavailable,
            )));
            self.send_iq(reply);
        }
    }

    fn notify_message_handlers(&mut self, msg: &Message, raw: &Tag) {
        if let Some(handler) = self.registry.muc_invitation_handler.clone() {
            if let Some(invitation) = parse_muc_invitation(msg, raw) {
                handler.handle_invitation(&invitation);
                return;
            }
        }

        // Sessions claim messages first: full-JID matches, then bare.
        let sessions = self.registry.message_sessions.clone();
        for bare in [false, true] {
            for session in &sessions {
                if session.matches(msg, bare) {
                    session.handle_message(msg);
                    return;
                }
            }
        }

        if let Some(opener) = self.registry.message_session_handler(msg.subtype) {
            let session = Arc::new(MessageSession::new(msg.from.clone(), msg.subtype as i32, false));
            self.registry.register_message_session(session.clone());
            opener.handle_message_session(&session);
            session.handle_message(msg);
            return;
        }

        let handlers = self.registry.message_handlers.clone();
        for handler in handlers {
            handler.handle_message(msg);
        }
    }

    fn notify_presence_handlers(&mut self, presence: &Presence) {
        let jid_handlers: Vec<Arc<dyn PresenceHandler>> = self
            .registry
            .presence_jid_handlers
            .iter()
            .filter(|(jid, _)| jid.bare() == presence.from.bare())
            .map(|(_, h)| h.clone())
            .collect();
        if !jid_handlers.is_empty() {
            for handler in jid_handlers {
                handler.handle_presence(presence);
            }
            return;
        }

        let handlers = self.registry.presence_handlers.clone();
        for handler in handlers {
            handler.handle_presence(presence);
        }
    }

    fn notify_subscription_handlers(&mut self, subscription: &Subscription) {
        let handlers = self.registry.subscription_handlers.clone();
        for handler in handlers {
            handler.handle_subscription(subscription);
        }
    }

    fn notify_tag_handlers(&mut self, tag: &Tag) {
        let handlers: Vec<Arc<dyn TagHandler>> = self
            .registry
            .tag_handlers
            .iter()
            .filter(|e| e.name == tag.name() && tag.has_attribute("xmlns", &e.xmlns))
            .map(|e| e.handler.clone())
            .collect();
        for handler in handlers {
            handler.handle_tag(tag);
        }
    }

    fn notify_statistics(&mut self) {
        if let Some(handler) = self.registry.statistics_handler.clone() {
            let stats = self.get_statistics();
            handler.handle_statistics(&stats);
        }
    }

    // --- registration passthrough for the lock-protected tables ---

    pub fn register_iq_handler(&self, handler: Arc<dyn IqHandler>, ext_type: i32) {
        self.registry.register_iq_handler(handler, ext_type);
    }

    pub fn remove_iq_handler(&self, handler: &Arc<dyn IqHandler>, ext_type: i32) {
        self.registry.remove_iq_handler(handler, ext_type);
    }

    pub fn remove_id_handler(&self, handler: &Arc<dyn IqHandler>) {
        self.registry.remove_id_handler(handler);
    }

    pub fn register_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.registry.register_connection_listener(listener);
    }

    pub fn register_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.registry.register_message_handler(handler);
    }

    pub fn register_presence_handler(&mut self, handler: Arc<dyn PresenceHandler>) {
        self.registry.register_presence_handler(handler);
    }

    pub fn register_subscription_handler(&mut self, handler: Arc<dyn SubscriptionHandler>) {
        self.registry.register_subscription_handler(handler);
    }

    pub fn register_tag_handler(&mut self, handler: Arc<dyn TagHandler>, name: &str, xmlns: &str) {
        self.registry.register_tag_handler(handler, name, xmlns);
    }

    pub fn register_statistics_handler(&mut self, handler: Arc<dyn StatisticsHandler>) {
        self.registry.register_statistics_handler(handler);
    }

    #[cfg(test)]
    fn reset_id_counter(&self) {
        self.next_id.store(0, Ordering::Relaxed);
    }
}

fn check_stream_version(version: &str) -> bool {
    if version.is_empty() {
        return false;
    }
    let major: i32 = match version.split('.').next().and_then(|m| m.parse().ok()) {
        Some(m) => m,
        None => return false,
    };
    XMPP_STREAM_VERSION_MAJOR >= major
}

/// Detect a mediated MUC invitation (XEP-0045 §7.8.2) on a raw
/// message tag.
fn parse_muc_invitation(msg: &Message, raw: &Tag) -> Option<MucInvitation> {
    let x = raw.find_child_ns("x", ns::MUC_USER)?;
    let invite = x.find_child("invite")?;
    let continue_tag = invite.find_child("continue");
    Some(MucInvitation {
        room: msg.from.clone(),
        from: invite.attribute("from").map(Jid::new).unwrap_or_default(),
        reason: invite
            .find_child("reason")
            .map(|r| r.cdata().to_string())
            .unwrap_or_default(),
        body: msg.body.clone(),
        password: x
            .find_child("password")
            .map(|p| p.cdata().to_string())
            .unwrap_or_default(),
        continued: continue_tag.is_some(),
        thread: continue_tag
            .and_then(|c| c.attribute("thread"))
            .unwrap_or_default()
            .to_string(),
    })
}
