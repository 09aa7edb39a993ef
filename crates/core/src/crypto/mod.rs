/// Cryptography and serialization for the onion protocol
///
/// Two sealing primitives and one codec, combined by the composed helpers in
/// `codec`:
/// - symmetric: AES-128-CFB keyed by a 128-bit circuit key, fresh IV per seal
/// - asymmetric: RSA-2048 OAEP (SHA-256) against a router's long-lived key
/// - codec: self-describing, field-name-preserving byte encoding
///
/// Upper layers only ever call `encode_then_seal_*` / `open_then_decode_*`.
pub mod codec;
pub mod keys;
pub mod seal;

pub use codec::{
    decode, encode, encode_then_seal_asym, encode_then_seal_sym, open_then_decode_asym,
    open_then_decode_sym,
};
pub use keys::{RsaKeyPair, SymKey};
pub use seal::{open_asym, open_sym, seal_asym, seal_sym};

/// Cryptographic errors
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Ciphertext shorter than one IV block")]
    CiphertextTooShort,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),
}
