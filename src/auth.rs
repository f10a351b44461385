//! Caller credential verification and backend credential substitution
//!
//! Callers may present a proxy-issued token: `Authorization: Bearer {auth_prefix}{token}`
//! where `token` is URL-safe base64 of `nonce || ciphertext || tag`, sealed with AES-256-GCM
//! under the configured key. The plaintext is the caller's identity. Tokens that fail to open
//! are rejected before any backend is contacted. Values without the prefix pass through
//! unless strict mode is on, and with no key configured everything passes through.
//!
//! Whatever the caller sent, backends only ever see their own credential.
use crate::endpoint::EndpointRecord;
use crate::errors::{AuthError, ConfigError};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use axum::http::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use std::fmt;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// URL-safe base64 that emits padding and accepts input with or without it.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Headers a caller might use to carry its own credential. None of them reach a backend.
const CALLER_CREDENTIAL_HEADERS: [HeaderName; 3] = [
    AUTHORIZATION,
    HeaderName::from_static("api-key"),
    HeaderName::from_static("x-api-key"),
];

/// Seals and opens caller tokens with a 32-byte key.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// Parse a base64-url encoded key.
    pub fn from_base64(key: &str) -> Result<Self, ConfigError> {
        let bytes = URL_SAFE_LENIENT
            .decode(key.trim())
            .map_err(|e| ConfigError::InvalidAuthKey(e.to_string()))?;
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ConfigError::InvalidAuthKey(format!("got {} bytes", bytes.len())))?;
        Ok(Self::new(&key))
    }

    /// A fresh random key, base64-url encoded.
    pub fn generate_key() -> String {
        URL_SAFE_LENIENT.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    /// Encrypt `plaintext` under a fresh nonce and encode the result as a token.
    pub fn seal(&self, plaintext: &str) -> Result<String, aes_gcm::Error> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext.as_bytes())?;

        let mut buf = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_LENIENT.encode(buf))
    }

    /// Decode and authenticate a token. Any failure is [`AuthError::Invalid`].
    pub fn open(&self, token: &str) -> Result<String, AuthError> {
        let buf = URL_SAFE_LENIENT
            .decode(token.trim())
            .map_err(|_| AuthError::Invalid)?;
        if buf.len() <= NONCE_LEN {
            return Err(AuthError::Invalid);
        }
        let (nonce, ciphertext) = buf.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::Invalid)?;
        String::from_utf8(plaintext).map_err(|_| AuthError::Invalid)
    }
}

/// Who is calling, as far as the proxy can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// No token layer configured, or no credential presented.
    Anonymous,
    /// A credential without the token prefix, accepted as-is.
    Unverified,
    /// A proxy-issued token that opened successfully, carrying the sealed identity.
    Verified(String),
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Anonymous => f.write_str("anonymous"),
            Caller::Unverified => f.write_str("unverified"),
            Caller::Verified(identity) => f.write_str(identity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CredentialRewriter {
    cipher: Option<TokenCipher>,
    prefix: String,
    require_token: bool,
}

impl CredentialRewriter {
    pub fn new(
        cipher: Option<TokenCipher>,
        prefix: impl Into<String>,
        require_token: bool,
    ) -> Self {
        Self {
            cipher,
            prefix: prefix.into(),
            require_token,
        }
    }

    /// No token layer: every caller passes through.
    pub fn disabled() -> Self {
        Self::new(None, "", false)
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Check the inbound `Authorization` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AuthError> {
        if self.cipher.is_none() {
            return Ok(Caller::Anonymous);
        }

        match headers.get(AUTHORIZATION) {
            None if self.require_token => Err(AuthError::Missing),
            None => Ok(Caller::Anonymous),
            Some(value) => {
                let value = value.to_str().map_err(|_| AuthError::Invalid)?;
                self.verify(value)
            }
        }
    }

    /// Check a raw `Authorization` value, with or without the `Bearer` scheme.
    pub fn verify(&self, value: &str) -> Result<Caller, AuthError> {
        let Some(cipher) = &self.cipher else {
            return Ok(Caller::Anonymous);
        };

        let credential = strip_bearer(value.trim());
        match credential.strip_prefix(self.prefix.as_str()) {
            Some(token) if !self.prefix.is_empty() => cipher.open(token).map(Caller::Verified),
            _ if self.require_token => Err(AuthError::Invalid),
            _ => Ok(Caller::Unverified),
        }
    }

    /// Produce the credential a caller should present for `identity`, if a key is configured.
    pub fn issue(&self, identity: &str) -> Option<Result<String, aes_gcm::Error>> {
        self.cipher
            .as_ref()
            .map(|cipher| cipher.seal(identity).map(|token| format!("{}{token}", self.prefix)))
    }

    /// Strip caller credentials from an outbound request and install the backend's own.
    pub fn apply_outbound(
        &self,
        headers: &mut HeaderMap,
        record: &EndpointRecord,
    ) -> Result<(), InvalidHeaderValue> {
        for name in &CALLER_CREDENTIAL_HEADERS {
            headers.remove(name);
        }
        if !record.credential.is_empty() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", record.credential))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        Ok(())
    }
}

fn strip_bearer(value: &str) -> &str {
    match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim_start(),
        _ => value,
    }
}
