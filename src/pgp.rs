//! PGP decryption primitive backing the `cget`/`cgets`/`cgetv`/`cgetvs`/
//! `cdecrypt` template functions (§4.2). Only constructed when
//! `pgp_private_key` is configured; absence of a key means those functions
//! are simply never bound.

use pgp::composed::{Deserializable, Message, SignedSecretKey};
use pgp::types::SecretKeyTrait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgpError {
    #[error("invalid PGP private key: {0}")]
    InvalidKey(String),

    #[error("base64 payload is invalid: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("PGP decryption failed: {0}")]
    Decrypt(String),
}

pub struct PgpKey {
    secret_key: SignedSecretKey,
}

impl PgpKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PgpError> {
        let (secret_key, _headers) = SignedSecretKey::from_bytes(bytes)
            .map_err(|e| PgpError::InvalidKey(e.to_string()))?;
        secret_key
            .verify()
            .map_err(|e| PgpError::InvalidKey(e.to_string()))?;
        Ok(Self { secret_key })
    }

    /// Base64-decodes `data`, then decrypts it as an armored or binary PGP
    /// message using the configured secret key, returning the plaintext as
    /// a UTF-8 string.
    pub fn decrypt(&self, data: &str) -> Result<String, PgpError> {
        use base64::Engine as _;

        let raw = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
        let message = Message::from_bytes(raw.as_slice())
            .map_err(|e| PgpError::Decrypt(e.to_string()))?;

        let (decrypted, _key_ids) = message
            .decrypt(|| String::new(), &[&self.secret_key])
            .map_err(|e| PgpError::Decrypt(e.to_string()))?;

        let content = decrypted
            .get_content()
            .map_err(|e| PgpError::Decrypt(e.to_string()))?
            .ok_or_else(|| PgpError::Decrypt("empty message".to_owned()))?;

        String::from_utf8(content).map_err(|e| PgpError::Decrypt(e.to_string()))
    }
}

impl std::fmt::Debug for PgpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgpKey").finish_non_exhaustive()
    }
}
