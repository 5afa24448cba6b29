//! Streaming hybrid encryption
//!
//! Every stream gets a one-time AES-256 key produced by RSA-KEM against the
//! cluster public key. The payload is sealed with AES-256-GCM and framed as:
//!
//! ```text
//! [key_words, nonce_len, tag_len] encapsulated_key nonce tag ciphertext...
//! ```
//!
//! `key_words` is the encapsulated key length in 8-byte words. The tag is only
//! known once all plaintext was consumed, so the encoder holds ciphertext back
//! (in memory up to a threshold, then in a temporary file) until `finish`.

mod envelope;
mod gcm;
mod hash;
mod kem;

use thiserror::Error;

pub use envelope::{
    DEFAULT_SPILL_THRESHOLD, EnvelopeDecoder, EnvelopeEncoder, NONCE_LEN, StreamCipher,
    StreamDecipher, TAG_LEN,
};
pub use hash::{sha256_hex, sha256_hex_bytes};
pub use kem::{parse_private_key_pem, parse_public_key_pem};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

/// Error types for the envelope codec
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Envelope truncated before its header was complete")]
    Truncated,

    #[error("Authentication tag mismatch")]
    AuthenticationFailed,

    #[error("Key encapsulation failed: {0}")]
    Kem(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
