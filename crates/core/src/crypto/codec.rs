use super::keys::SymKey;
use super::seal::{open_asym, open_sym, seal_asym, seal_sym};
use super::CryptoError;
use rsa::RsaPrivateKey;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a structured value to self-describing bytes.
///
/// The encoding preserves field names, so both ends only need to agree on
/// the type schema; payload types carry `deny_unknown_fields`, making an
/// unrecognized field a decode error rather than silent drift.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(value).map_err(|e| CryptoError::Encode(e.to_string()))
}

/// Decode self-describing bytes back into a structured value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CryptoError> {
    serde_json::from_slice(bytes).map_err(|e| CryptoError::Decode(e.to_string()))
}

/// Encode a value, then seal it under a circuit key
pub fn encode_then_seal_sym<T: Serialize>(key: &SymKey, value: &T) -> Result<Vec<u8>, CryptoError> {
    seal_sym(key, &encode(value)?)
}

/// Open a symmetric seal, then decode the plaintext
pub fn open_then_decode_sym<T: DeserializeOwned>(
    key: &SymKey,
    sealed: &[u8],
) -> Result<T, CryptoError> {
    decode(&open_sym(key, sealed)?)
}

/// Encode a value, then seal it to a router's public key
pub fn encode_then_seal_asym<T: Serialize>(
    public_der: &[u8],
    value: &T,
) -> Result<Vec<u8>, CryptoError> {
    seal_asym(public_der, &encode(value)?)
}

/// Open an asymmetric seal, then decode the plaintext
pub fn open_then_decode_asym<T: DeserializeOwned>(
    private: &RsaPrivateKey,
    sealed: &[u8],
) -> Result<T, CryptoError> {
    decode(&open_asym(private, sealed)?)
}
