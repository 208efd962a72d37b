//! SASL mechanism negotiation and challenge/response computation.
//!
//! Implements SCRAM-SHA-1 and SCRAM-SHA-1-PLUS (RFC 5802), DIGEST-MD5
//! (RFC 2831), PLAIN, EXTERNAL and ANONYMOUS. The computations are
//! pure given the nonce, so tests drive them with the RFC vectors.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::prep;

/// Supported mechanisms, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    ScramSha1Plus,
    ScramSha1,
    DigestMd5,
    External,
    Plain,
    Anonymous,
}

impl SaslMechanism {
    pub fn name(self) -> &'static str {
        match self {
            SaslMechanism::ScramSha1Plus => "SCRAM-SHA-1-PLUS",
            SaslMechanism::ScramSha1 => "SCRAM-SHA-1",
            SaslMechanism::DigestMd5 => "DIGEST-MD5",
            SaslMechanism::External => "EXTERNAL",
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Anonymous => "ANONYMOUS",
        }
    }

    pub fn from_name(name: &str) -> Option<SaslMechanism> {
        Some(match name {
            "SCRAM-SHA-1-PLUS" => SaslMechanism::ScramSha1Plus,
            "SCRAM-SHA-1" => SaslMechanism::ScramSha1,
            "DIGEST-MD5" => SaslMechanism::DigestMd5,
            "EXTERNAL" => SaslMechanism::External,
            "PLAIN" => SaslMechanism::Plain,
            "ANONYMOUS" => SaslMechanism::Anonymous,
            _ => return None,
        })
    }

    fn bit(self) -> u32 {
        match self {
            SaslMechanism::ScramSha1Plus => 1,
            SaslMechanism::ScramSha1 => 2,
            SaslMechanism::DigestMd5 => 4,
            SaslMechanism::External => 8,
            SaslMechanism::Plain => 16,
            SaslMechanism::Anonymous => 32,
        }
    }
}

/// A set of mechanisms, used both for "what the server offered" and
/// "what the application allows".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismSet(u32);

impl MechanismSet {
    pub const NONE: MechanismSet = MechanismSet(0);
    pub const ALL: MechanismSet = MechanismSet(u32::MAX);

    pub fn empty() -> MechanismSet {
        MechanismSet::NONE
    }

    pub fn insert(&mut self, mech: SaslMechanism) {
        self.0 |= mech.bit();
    }

    pub fn remove(&mut self, mech: SaslMechanism) {
        self.0 &= !mech.bit();
    }

    pub fn contains(self, mech: SaslMechanism) -> bool {
        self.0 & mech.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// What the engine knows about the account being authenticated.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Authentication id; falls back to the JID node when empty.
    pub authcid: String,
    /// Authorization id (bare JID form) when acting on behalf of
    /// another account.
    pub authzid: String,
    pub password: String,
    /// The server domain, used by DIGEST-MD5's digest-uri and realm
    /// fallback.
    pub domain: String,
    /// JID node, the authcid fallback.
    pub username: String,
}

impl Credentials {
    fn effective_authcid(&self) -> &str {
        if self.authcid.is_empty() {
            &self.username
        } else {
            &self.authcid
        }
    }
}

/// HMAC-SHA-1, the SCRAM PRF.
fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length; initialization cannot fail.
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// `Hi(str, salt, i)` from RFC 5802 §2.2: PBKDF2-HMAC-SHA1 with a
/// 20-byte output, so a single block with the counter `\x00\x00\x00\x01`.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 20] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&[0, 0, 0, 1]);

    let mut u = hmac_sha1(password, &block);
    let mut output = u;
    for _ in 1..iterations {
        u = hmac_sha1(password, &u);
        for (o, b) in output.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    output
}

fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut sha = Sha1::new();
    sha.update(data);
    sha.finalize().into()
}

fn md5_raw(parts: &[&[u8]]) -> [u8; 16] {
    let mut md5 = Md5::new();
    for part in parts {
        md5.update(part);
    }
    md5.finalize().into()
}

fn md5_hex(parts: &[&[u8]]) -> String {
    hex::encode(md5_raw(parts))
}

/// The fields of a parsed SCRAM server-first message.
#[derive(Debug, PartialEq)]
struct ServerFirst {
    snonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

fn parse_server_first(message: &str) -> Option<ServerFirst> {
    let mut snonce = None;
    let mut salt = None;
    let mut iterations = None;
    for field in message.split(',') {
        if let Some(v) = field.strip_prefix("r=") {
            snonce = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("s=") {
            salt = Some(BASE64_STANDARD.decode(v).ok()?);
        } else if let Some(v) = field.strip_prefix("i=") {
            iterations = Some(v.parse().ok()?);
        }
    }
    Some(ServerFirst {
        snonce: snonce?,
        salt: salt?,
        iterations: iterations?,
    })
}

/// Per-authentication scratch state, created by `client_first` and
/// consumed across the challenge/success exchange.
#[derive(Debug, Default)]
pub struct SaslContext {
    pub mechanism: Option<SaslMechanism>,
    gs2_header: String,
    client_first_bare: String,
    server_signature: [u8; 20],
    scram_verified: bool,
}

impl SaslContext {
    pub fn new() -> SaslContext {
        SaslContext::default()
    }

    /// Build the `<auth/>` payload for the selected mechanism. The
    /// caller supplies the nonce so the exchange is reproducible.
    /// Returns `None` for mechanisms that open without a payload.
    pub fn client_first(
        &mut self,
        mechanism: SaslMechanism,
        creds: &Credentials,
        nonce: &str,
        server_offers_plus: bool,
        channel_binding_type: &str,
    ) -> Option<String> {
        self.mechanism = Some(mechanism);
        match mechanism {
            SaslMechanism::ScramSha1 | SaslMechanism::ScramSha1Plus => {
                self.gs2_header = if mechanism == SaslMechanism::ScramSha1Plus {
                    format!("p={},", channel_binding_type)
                } else if server_offers_plus {
                    "n,".to_string()
                } else {
                    "y,".to_string()
                };
                if !creds.authzid.is_empty() {
                    if let Some(authzid) = prep::saslprep(&creds.authzid) {
                        self.gs2_header.push_str("a=");
                        self.gs2_header.push_str(&authzid);
                    }
                }
                self.gs2_header.push(',');

                self.client_first_bare = "n=".to_string();
                if let Some(name) = prep::saslprep(creds.effective_authcid()) {
                    self.client_first_bare.push_str(&name);
                }
                self.client_first_bare.push_str(",r=");
                self.client_first_bare.push_str(nonce);

                let first = format!("{}{}", self.gs2_header, self.client_first_bare);
                Some(BASE64_STANDARD.encode(first))
            }
            SaslMechanism::Plain => {
                let mut payload = Vec::new();
                payload.extend_from_slice(creds.authzid.as_bytes());
                payload.push(0);
                payload.extend_from_slice(creds.effective_authcid().as_bytes());
                payload.push(0);
                payload.extend_from_slice(creds.password.as_bytes());
                Some(BASE64_STANDARD.encode(payload))
            }
            SaslMechanism::External => {
                let identity = if creds.authzid.is_empty() {
                    format!("{}@{}", creds.username, creds.domain)
                } else {
                    creds.authzid.clone()
                };
                Some(BASE64_STANDARD.encode(identity))
            }
            // DIGEST-MD5 opens empty and answers the first challenge;
            // ANONYMOUS never carries data.
            SaslMechanism::DigestMd5 | SaslMechanism::Anonymous => None,
        }
    }

    /// Compute the `<response/>` payload for a decoded challenge.
    /// `cnonce` feeds DIGEST-MD5; `channel_binding` feeds SCRAM-PLUS.
    /// An empty return means an empty `<response/>` element.
    pub fn challenge(
        &mut self,
        challenge: &[u8],
        creds: &Credentials,
        cnonce: &str,
        channel_binding: &[u8],
    ) -> String {
        match self.mechanism {
            Some(SaslMechanism::ScramSha1) | Some(SaslMechanism::ScramSha1Plus) => {
                self.scram_challenge(challenge, creds, channel_binding)
            }
            Some(SaslMechanism::DigestMd5) => self.digest_md5_challenge(challenge, creds, cnonce),
            _ => String::new(),
        }
    }

    fn scram_challenge(&mut self, challenge: &[u8], creds: &Credentials, channel_binding: &[u8]) -> String {
        let server_first = String::from_utf8_lossy(challenge).into_owned();
        let parsed = match parse_server_first(&server_first) {
            Some(p) => p,
            None => return String::new(),
        };
        let password = match prep::saslprep(&creds.password) {
            Some(p) => p,
            None => return String::new(),
        };

        let salted_password = hi(password.as_bytes(), &parsed.salt, parsed.iterations);
        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = sha1_digest(&client_key);

        let c = if self.mechanism == Some(SaslMechanism::ScramSha1Plus) {
            let mut material = self.gs2_header.clone().into_bytes();
            material.extend_from_slice(channel_binding);
            BASE64_STANDARD.encode(material)
        } else {
            BASE64_STANDARD.encode(self.gs2_header.as_bytes())
        };
        let client_final_bare = format!("c={},r={}", c, parsed.snonce);

        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, client_final_bare);
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let mut client_proof = client_key;
        for (p, s) in client_proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }
        let server_key = hmac_sha1(&salted_password, b"Server Key");
        self.server_signature = hmac_sha1(&server_key, auth_message.as_bytes());

        let client_final = format!("{},p={}", client_final_bare, BASE64_STANDARD.encode(client_proof));
        BASE64_STANDARD.encode(client_final)
    }

    fn digest_md5_challenge(&mut self, challenge: &[u8], creds: &Credentials, cnonce: &str) -> String {
        let challenge = String::from_utf8_lossy(challenge).into_owned();
        // The second (rspauth) challenge is acknowledged with an empty
        // response.
        if challenge.starts_with("rspauth") {
            return String::new();
        }

        let realm = match extract_quoted(&challenge, "realm=") {
            Some(r) => r,
            None => creds.domain.clone(),
        };
        let nonce = match extract_quoted(&challenge, "nonce=") {
            Some(n) => n,
            None => return String::new(),
        };

        let username = creds.effective_authcid();
        let a1_h = md5_raw(&[username.as_bytes(), b":", realm.as_bytes(), b":", creds.password.as_bytes()]);
        let a1 = md5_hex(&[&a1_h, b":", nonce.as_bytes(), b":", cnonce.as_bytes()]);
        let a2 = md5_hex(&[b"AUTHENTICATE:xmpp/", creds.domain.as_bytes()]);
        let response_value = md5_hex(&[
            a1.as_bytes(),
            b":",
            nonce.as_bytes(),
            b":00000001:",
            cnonce.as_bytes(),
            b":auth:",
            a2.as_bytes(),
        ]);

        let mut response = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc=00000001,qop=auth,digest-uri=\"xmpp/{}\",response={},charset=utf-8",
            username, realm, nonce, cnonce, creds.domain, response_value
        );
        if !creds.authzid.is_empty() {
            response.push_str(",authzid=");
            response.push_str(&creds.authzid);
        }
        BASE64_STANDARD.encode(response)
    }

    /// Verify a `<success/>` payload. For SCRAM the payload must carry
    /// `v=<base64>` matching the remembered server signature; other
    /// mechanisms accept unconditionally.
    pub fn verify_success(&mut self, payload: &str) -> bool {
        match self.mechanism {
            Some(SaslMechanism::ScramSha1) | Some(SaslMechanism::ScramSha1Plus) => {
                let decoded = match BASE64_STANDARD.decode(payload) {
                    Ok(d) => d,
                    Err(_) => return false,
                };
                if decoded.len() < 3 || !decoded.starts_with(b"v=") {
                    return false;
                }
                let value = match BASE64_STANDARD.decode(&decoded[2..]) {
                    Ok(v) => v,
                    Err(_) => return false,
                };
                self.scram_verified = value == self.server_signature;
                self.scram_verified
            }
            _ => true,
        }
    }
}

/// Pull a `key="value"` field out of a DIGEST-MD5 challenge, honoring
/// escaped quotes in the value.
fn extract_quoted(challenge: &str, key: &str) -> Option<String> {
    let start = challenge.find(key)? + key.len();
    let rest = challenge.get(start..)?;
    let rest = rest.strip_prefix('"')?;
    let mut end = 0;
    let bytes = rest.as_bytes();
    while end < bytes.len() {
        if bytes[end] == b'"' && (end == 0 || bytes[end - 1] != b'\\') {
            break;
        }
        end += 1;
    }
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            authcid: String::new(),
            authzid: String::new(),
            password: "pencil".to_string(),
            domain: "example.org".to_string(),
            username: "user".to_string(),
        }
    }

    #[test]
    fn test_plain_payload() {
        let mut ctx = SaslContext::new();
        let creds = Credentials {
            username: "romeo".to_string(),
            password: "pass".to_string(),
            domain: "example.org".to_string(),
            ..Credentials::default()
        };
        let payload = ctx.client_first(SaslMechanism::Plain, &creds, "", false, "").unwrap();
        assert_eq!(payload, "AHJvbWVvAHBhc3M=");
    }

    #[test]
    fn test_scram_client_first_message() {
        let mut ctx = SaslContext::new();
        let payload = ctx
            .client_first(SaslMechanism::ScramSha1, &creds(), "fyko+d2lbbFgONRv9qkxdawL", true, "")
            .unwrap();
        let decoded = BASE64_STANDARD.decode(payload).unwrap();
        assert_eq!(decoded, b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
    }

    #[test]
    fn test_scram_gs2_guard_when_server_lacks_plus() {
        let mut ctx = SaslContext::new();
        let payload = ctx
            .client_first(SaslMechanism::ScramSha1, &creds(), "abc", false, "")
            .unwrap();
        let decoded = BASE64_STANDARD.decode(payload).unwrap();
        assert!(decoded.starts_with(b"y,,"));
    }

    // RFC 5802 §5 example exchange.
    #[test]
    fn test_scram_rfc_vector() {
        let mut ctx = SaslContext::new();
        ctx.client_first(SaslMechanism::ScramSha1, &creds(), "fyko+d2lbbFgONRv9qkxdawL", true, "");

        let server_first = b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let response = ctx.challenge(server_first, &creds(), "", b"");
        let decoded = String::from_utf8(BASE64_STANDARD.decode(response).unwrap()).unwrap();
        assert_eq!(
            decoded,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        let success = BASE64_STANDARD.encode("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=");
        assert!(ctx.verify_success(&success));
    }

    #[test]
    fn test_scram_rejects_tampered_signature() {
        let mut ctx = SaslContext::new();
        ctx.client_first(SaslMechanism::ScramSha1, &creds(), "fyko+d2lbbFgONRv9qkxdawL", true, "");
        ctx.challenge(
            b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            &creds(),
            "",
            b"",
        );
        // Flip one character of the signature.
        let success = BASE64_STANDARD.encode("v=rmF9pqV8S7suAoZWja4dJRkGsKQ=");
        assert!(!ctx.verify_success(&success));
    }

    #[test]
    fn test_scram_plus_embeds_channel_binding() {
        let mut ctx = SaslContext::new();
        ctx.client_first(SaslMechanism::ScramSha1Plus, &creds(), "nonce1", true, "tls-exporter");
        let response = ctx.challenge(b"r=nonce1srv,s=QSXCR+Q6sek8bf92,i=4096", &creds(), "", b"\x01\x02\x03");
        let decoded = String::from_utf8(BASE64_STANDARD.decode(response).unwrap()).unwrap();

        let mut expected = b"p=tls-exporter,,".to_vec();
        expected.extend_from_slice(b"\x01\x02\x03");
        let expected_c = BASE64_STANDARD.encode(expected);
        assert!(decoded.starts_with(&format!("c={},r=nonce1srv", expected_c)));
    }

    #[test]
    fn test_hi_matches_single_iteration() {
        // One iteration makes Hi a bare HMAC over salt||INT(1).
        let expected = hmac_sha1(b"secret", b"salt\x00\x00\x00\x01");
        assert_eq!(hi(b"secret", b"salt", 1), expected);
    }

    #[test]
    fn test_digest_md5_reproducible() {
        let challenge = b"realm=\"example.org\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",charset=utf-8,algorithm=md5-sess";
        let mut ctx = SaslContext::new();
        ctx.mechanism = Some(SaslMechanism::DigestMd5);
        let first = ctx.challenge(challenge, &creds(), "OA6MHXh6VqTrRk", b"");
        let again = ctx.challenge(challenge, &creds(), "OA6MHXh6VqTrRk", b"");
        assert_eq!(first, again);

        let decoded = String::from_utf8(BASE64_STANDARD.decode(&first).unwrap()).unwrap();
        assert!(decoded.contains("username=\"user\""));
        assert!(decoded.contains("realm=\"example.org\""));
        assert!(decoded.contains("nonce=\"OA6MG9tEQGm2hh\""));
        assert!(decoded.contains("nc=00000001"));
        assert!(decoded.contains("digest-uri=\"xmpp/example.org\""));

        // Any input change changes the digest.
        let other = ctx.challenge(challenge, &creds(), "differentcnonce", b"");
        assert_ne!(first, other);
    }

    #[test]
    fn test_digest_md5_rspauth_is_acknowledged_empty() {
        let mut ctx = SaslContext::new();
        ctx.mechanism = Some(SaslMechanism::DigestMd5);
        assert_eq!(ctx.challenge(b"rspauth=1234", &creds(), "x", b""), "");
    }

    #[test]
    fn test_digest_md5_realm_falls_back_to_domain() {
        let mut ctx = SaslContext::new();
        ctx.mechanism = Some(SaslMechanism::DigestMd5);
        let response = ctx.challenge(b"nonce=\"abc\",qop=\"auth\"", &creds(), "cn", b"");
        let decoded = String::from_utf8(BASE64_STANDARD.decode(response).unwrap()).unwrap();
        assert!(decoded.contains("realm=\"example.org\""));
    }

    #[test]
    fn test_external_uses_bare_jid() {
        let mut ctx = SaslContext::new();
        let payload = ctx.client_first(SaslMechanism::External, &creds(), "", false, "").unwrap();
        assert_eq!(BASE64_STANDARD.decode(payload).unwrap(), b"user@example.org");
    }

    #[test]
    fn test_anonymous_has_no_payload() {
        let mut ctx = SaslContext::new();
        assert!(ctx.client_first(SaslMechanism::Anonymous, &creds(), "", false, "").is_none());
    }

    #[test]
    fn test_mechanism_set() {
        let mut set = MechanismSet::empty();
        assert!(set.is_empty());
        set.insert(SaslMechanism::ScramSha1);
        set.insert(SaslMechanism::Plain);
        assert!(set.contains(SaslMechanism::ScramSha1));
        assert!(!set.contains(SaslMechanism::DigestMd5));
        set.remove(SaslMechanism::Plain);
        assert!(!set.contains(SaslMechanism::Plain));
        assert!(MechanismSet::ALL.contains(SaslMechanism::Anonymous));
    }

    #[test]
    fn test_server_first_parsing() {
        let parsed = parse_server_first("r=abc,s=c2FsdA==,i=4096").unwrap();
        assert_eq!(parsed.snonce, "abc");
        assert_eq!(parsed.salt, b"salt");
        assert_eq!(parsed.iterations, 4096);
        assert!(parse_server_first("s=c2FsdA==,i=4096").is_none());
    }

    #[test]
    fn test_extract_quoted_with_escapes() {
        assert_eq!(
            extract_quoted("nonce=\"ab\\\"cd\",qop=\"auth\"", "nonce="),
            Some("ab\\\"cd".to_string())
        );
        assert_eq!(extract_quoted("qop=\"auth\"", "nonce="), None);
    }
}
