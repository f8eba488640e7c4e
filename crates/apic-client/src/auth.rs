//! APIC authentication material and certificate request signing.
//!
//! Two modes are supported:
//! - Password: the client logs in through `aaaLogin` and replays the session
//!   token as the `APIC-cookie` cookie.
//! - Certificate: every request is signed with the user's RSA private key
//!   (RSA-SHA256 over method, path and body) and the signature travels in
//!   `APIC-*` cookies next to the certificate DN.

use crate::dn;
use crate::error::ApicError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::rand::SystemRandom;
use ring::signature::{RSA_PKCS1_SHA256, RsaKeyPair};
use rustls_pemfile::Item;
use std::fmt;

/// Credentials used to authenticate against APIC
#[derive(Clone, PartialEq, Eq)]
pub enum ApicAuth {
    /// Username/password login
    Password(String),

    /// Signed requests with a private key registered as `cert_name`
    Certificate {
        /// PEM-encoded RSA private key (PKCS#1 or PKCS#8)
        private_key: String,
        /// Name of the certificate object under the user
        cert_name: String,
    },
}

impl ApicAuth {
    /// Certificate auth using the user's admin certificate (`<user>.crt`)
    #[must_use]
    pub fn certificate(username: &str, private_key: impl Into<String>) -> Self {
        Self::Certificate {
            private_key: private_key.into(),
            cert_name: dn::admin_cert_name(username),
        }
    }

    /// True for password auth
    #[must_use]
    pub fn is_password(&self) -> bool {
        matches!(self, Self::Password(_))
    }
}

impl fmt::Debug for ApicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
            Self::Certificate { cert_name, .. } => f
                .debug_struct("Certificate")
                .field("private_key", &"<redacted>")
                .field("cert_name", cert_name)
                .finish(),
        }
    }
}

/// Connection settings for one APIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApicConfig {
    /// APIC host (`10.0.0.1`, `apic.example.com:8443`) or a full base URL
    pub host: String,
    /// APIC user
    pub username: String,
    /// Password or private key
    pub auth: ApicAuth,
}

impl ApicConfig {
    /// `https://<host>`, or the host verbatim when it already carries a scheme
    #[must_use]
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }
}

/// Credentials resolved for a live client
pub(crate) enum Credentials {
    Password(String),
    Certificate(RequestSigner),
}

/// Signs APIC requests with an RSA private key
pub(crate) struct RequestSigner {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
    cert_dn: String,
}

impl fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSigner").field("cert_dn", &self.cert_dn).finish_non_exhaustive()
    }
}

impl RequestSigner {
    /// Parse the first RSA key found in `pem`
    pub(crate) fn from_pem(pem: &str, cert_dn: String) -> Result<Self, ApicError> {
        let mut reader = pem.as_bytes();
        for item in rustls_pemfile::read_all(&mut reader) {
            let key_pair = match item.map_err(|e| ApicError::InvalidKey(e.to_string()))? {
                Item::Pkcs8Key(key) => RsaKeyPair::from_pkcs8(key.secret_pkcs8_der()),
                Item::Pkcs1Key(key) => RsaKeyPair::from_der(key.secret_pkcs1_der()),
                _ => continue,
            }
            .map_err(|e| ApicError::InvalidKey(format!("rejected RSA key: {e}")))?;

            return Ok(Self {
                key_pair,
                rng: SystemRandom::new(),
                cert_dn,
            });
        }
        Err(ApicError::InvalidKey("no RSA private key found in PEM data".to_string()))
    }

    /// Base64 RSA-SHA256 signature over `method + path + body`
    fn sign(&self, method: &str, path: &str, body: &str) -> Result<String, ApicError> {
        let payload = format!("{method}{path}{body}");
        let mut signature = vec![0; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, payload.as_bytes(), &mut signature)
            .map_err(|e| ApicError::InvalidKey(format!("signing failed: {e}")))?;
        Ok(STANDARD.encode(signature))
    }

    /// `Cookie` header value for one request
    pub(crate) fn cookie(&self, method: &str, path: &str, body: &str) -> Result<String, ApicError> {
        let signature = self.sign(method, path, body)?;
        Ok(signature_cookie(&signature, &self.cert_dn))
    }
}

/// Cookie header carrying a request signature
pub(crate) fn signature_cookie(signature: &str, cert_dn: &str) -> String {
    format!(
        "APIC-Request-Signature={signature}; APIC-Certificate-Algorithm=v1.0; \
         APIC-Certificate-Fingerprint=fingerprint; APIC-Certificate-DN={cert_dn}"
    )
}

/// Cookie header carrying a session token
pub(crate) fn session_cookie(token: &str) -> String {
    format!("APIC-cookie={token}")
}
