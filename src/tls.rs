//! TLS engine seam and the rustls-backed default implementation.
//!
//! The engine is sans-io: the stream core hands it wire bytes and
//! plaintext and routes whatever the engine produces. rustls's
//! `ClientConnection` has exactly this shape (`read_tls` /
//! `process_new_packets` / `write_tls`), so the default engine is a
//! thin pump around it.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::error::ConnectionError;

/// Channel-binding exporter label (RFC 9266).
const EXPORTER_LABEL: &[u8] = b"EXPORTER-Channel-Binding";
const EXPORTER_LEN: usize = 32;

/// What the application learns about the peer once the handshake
/// completes, and the basis of the `on_tls_connect` accept/reject
/// decision.
#[derive(Debug, Clone, Default)]
pub struct CertInfo {
    /// Whether the chain validated against the configured roots.
    pub chain_verified: bool,
    /// The server name the certificate was checked against.
    pub server: String,
    /// Negotiated protocol, e.g. `TLSv1_3`.
    pub protocol: String,
    /// Negotiated cipher suite.
    pub cipher: String,
}

/// Bytes produced by one decrypt step.
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// Wire bytes to send to the peer (handshake records, acks).
    pub send: Vec<u8>,
    /// Decrypted application bytes.
    pub plaintext: Vec<u8>,
    /// Set on the step that completed the handshake.
    pub handshake_complete: Option<CertInfo>,
}

/// The encryption stage of the transform chain.
pub trait TlsEngine: Send {
    /// Load key material and trust roots. Empty paths select the
    /// platform trust store and no client certificate.
    fn init(&mut self, client_key: &str, client_certs: &str, ca_certs: &[String]) -> bool;

    /// Start the handshake; returns the initial records to send.
    fn handshake(&mut self) -> Result<Vec<u8>, ConnectionError>;

    /// Feed wire bytes from the peer.
    fn decrypt(&mut self, wire: &[u8]) -> Result<TlsProgress, ConnectionError>;

    /// Protect plaintext; returns wire records.
    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, ConnectionError>;

    /// Channel-binding type usable in a SCRAM `p=` gs2 header.
    fn channel_binding_type(&self) -> &'static str;

    /// Channel-binding material, once the handshake completed.
    fn channel_binding(&self) -> Option<Vec<u8>>;

    /// Drop session state; the engine stays reusable.
    fn cleanup(&mut self);
}

/// Install the process-wide crypto provider once.
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS certificate verifier that accepts all certificates without
/// validation.
///
/// **DANGEROUS**: only selected via `set_insecure(true)`; intended for
/// development against servers with self-signed certificates.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Default TLS engine over rustls.
pub struct RustlsTls {
    server: String,
    config: Option<Arc<ClientConfig>>,
    conn: Option<ClientConnection>,
    handshake_done: bool,
    insecure: bool,
}

impl RustlsTls {
    pub fn new(server: &str) -> RustlsTls {
        init_crypto_provider();
        RustlsTls {
            server: server.to_string(),
            config: None,
            conn: None,
            handshake_done: false,
            insecure: false,
        }
    }

    /// Disable certificate validation. Development only.
    pub fn set_insecure(&mut self, insecure: bool) {
        self.insecure = insecure;
        self.config = None;
    }

    fn load_roots(ca_certs: &[String]) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        if ca_certs.is_empty() {
            let native = rustls_native_certs::load_native_certs();
            if native.certs.is_empty() {
                warn!("no native root certificates found");
            }
            for cert in native.certs {
                roots.add(cert).ok();
            }
        } else {
            for path in ca_certs {
                let Ok(file) = File::open(path) else {
                    warn!(path = %path, "cannot open CA bundle");
                    continue;
                };
                for cert in rustls_pemfile::certs(&mut BufReader::new(file)).flatten() {
                    roots.add(cert).ok();
                }
            }
        }
        roots
    }

    fn build_config(&mut self, client_key: &str, client_certs: &str, ca_certs: &[String]) -> Option<Arc<ClientConfig>> {
        let roots = Self::load_roots(ca_certs);

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = if !client_key.is_empty() && !client_certs.is_empty() {
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut BufReader::new(File::open(client_certs).ok()?))
                    .collect::<Result<_, _>>()
                    .ok()?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(client_key).ok()?)).ok()??;
            builder.with_client_auth_cert(certs, key).ok()?
        } else {
            builder.with_no_client_auth()
        };

        if self.insecure {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureCertVerifier(rustls::crypto::CryptoProvider::get_default()?.clone())));
        }
        Some(Arc::new(config))
    }

    /// Flush everything rustls wants on the wire.
    fn drain_outgoing(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::TlsFailed)?;
        let mut out = Vec::new();
        while conn.wants_write() {
            conn.write_tls(&mut out).map_err(|_| ConnectionError::TlsFailed)?;
        }
        Ok(out)
    }

    fn drain_plaintext(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::TlsFailed)?;
        let mut plain = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plain.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return Err(ConnectionError::TlsFailed),
            }
        }
        Ok(plain)
    }

    fn cert_info(&self) -> CertInfo {
        let mut info = CertInfo {
            chain_verified: !self.insecure,
            server: self.server.clone(),
            ..CertInfo::default()
        };
        if let Some(conn) = self.conn.as_ref() {
            if let Some(proto) = conn.protocol_version() {
                info.protocol = format!("{:?}", proto);
            }
            if let Some(suite) = conn.negotiated_cipher_suite() {
                info.cipher = format!("{:?}", suite.suite());
            }
        }
        info
    }
}

impl TlsEngine for RustlsTls {
    fn init(&mut self, client_key: &str, client_certs: &str, ca_certs: &[String]) -> bool {
        match self.build_config(client_key, client_certs, ca_certs) {
            Some(config) => {
                self.config = Some(config);
                true
            }
            None => false,
        }
    }

    fn handshake(&mut self) -> Result<Vec<u8>, ConnectionError> {
        if self.config.is_none() && !self.init("", "", &[]) {
            return Err(ConnectionError::TlsFailed);
        }
        let config = self.config.clone().ok_or(ConnectionError::TlsFailed)?;
        let name = ServerName::try_from(self.server.clone()).map_err(|_| ConnectionError::TlsFailed)?;
        let conn = ClientConnection::new(config, name).map_err(|e| {
            warn!(error = %e, "TLS client setup failed");
            ConnectionError::TlsFailed
        })?;
        self.conn = Some(conn);
        self.handshake_done = false;
        self.drain_outgoing()
    }

    fn decrypt(&mut self, wire: &[u8]) -> Result<TlsProgress, ConnectionError> {
        let mut progress = TlsProgress::default();
        let mut rest = wire;
        while !rest.is_empty() {
            let conn = self.conn.as_mut().ok_or(ConnectionError::TlsFailed)?;
            let n = conn.read_tls(&mut rest).map_err(|_| ConnectionError::TlsFailed)?;
            if n == 0 {
                break;
            }
            if let Err(e) = conn.process_new_packets() {
                warn!(error = %e, "TLS record processing failed");
                return Err(ConnectionError::TlsFailed);
            }
            progress.send.extend(self.drain_outgoing()?);
            progress.plaintext.extend(self.drain_plaintext()?);
        }

        if !self.handshake_done {
            let still = self.conn.as_ref().map(|c| c.is_handshaking()).unwrap_or(true);
            if !still {
                self.handshake_done = true;
                let info = self.cert_info();
                debug!(protocol = %info.protocol, cipher = %info.cipher, "TLS handshake complete");
                progress.handshake_complete = Some(info);
            }
        }
        Ok(progress)
    }

    fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let conn = self.conn.as_mut().ok_or(ConnectionError::TlsFailed)?;
        conn.writer().write_all(plain).map_err(|_| ConnectionError::TlsFailed)?;
        self.drain_outgoing()
    }

    fn channel_binding_type(&self) -> &'static str {
        "tls-exporter"
    }

    fn channel_binding(&self) -> Option<Vec<u8>> {
        if !self.handshake_done {
            return None;
        }
        let conn = self.conn.as_ref()?;
        conn.export_keying_material(vec![0u8; EXPORTER_LEN], EXPORTER_LABEL, Some(&[]))
            .ok()
    }

    fn cleanup(&mut self) {
        self.conn = None;
        self.handshake_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_binding_absent_before_handshake() {
        let tls = RustlsTls::new("example.org");
        assert!(tls.channel_binding().is_none());
        assert_eq!(tls.channel_binding_type(), "tls-exporter");
    }

    #[test]
    fn test_handshake_emits_client_hello() {
        let mut tls = RustlsTls::new("example.org");
        tls.set_insecure(true);
        let hello = tls.handshake().unwrap();
        // A TLS handshake record: content type 0x16, version major 3.
        assert!(hello.len() > 5);
        assert_eq!(hello[0], 0x16);
        assert_eq!(hello[1], 0x03);
    }

    #[test]
    fn test_cleanup_resets_session() {
        let mut tls = RustlsTls::new("example.org");
        tls.set_insecure(true);
        tls.handshake().unwrap();
        tls.cleanup();
        assert!(tls.channel_binding().is_none());
        // A fresh handshake starts over.
        assert!(tls.handshake().is_ok());
    }
}
