use super::CryptoError;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use veilnet_common::circuit::{RSA_BITS, SYM_KEY_LEN};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 128-bit symmetric circuit key.
///
/// One is minted per (client, router) pair during circuit construction and
/// lives at the router until teardown or TTL expiry. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey([u8; SYM_KEY_LEN]);

impl SymKey {
    /// Generate a fresh key from the OS entropy source
    pub fn generate() -> Self {
        let mut key = [0u8; SYM_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; SYM_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SYM_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: SYM_KEY_LEN,
                actual: bytes.len(),
            });
        }

        let mut key = [0u8; SYM_KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; SYM_KEY_LEN] {
        &self.0
    }
}

// Key material stays out of logs.
impl fmt::Debug for SymKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymKey(..)")
    }
}

/// Process-lifetime RSA keypair for a router.
///
/// The public half travels to the coordinator as PKCS#1 DER and is handed to
/// clients inside onion rings; the private half never leaves the router.
pub struct RsaKeyPair {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
}

impl RsaKeyPair {
    /// Generate a 2048-bit keypair
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let public_der = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?
            .into_vec();

        Ok(Self {
            private,
            public_der,
        })
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Public key as PKCS#1 DER bytes, the wire representation
    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }
}

impl fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("public_der_len", &self.public_der.len())
            .finish()
    }
}

/// Parse a peer's PKCS#1 DER public key
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|_| CryptoError::InvalidPublicKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sym_key_generation_is_random() {
        let k1 = SymKey::generate();
        let k2 = SymKey::generate();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_sym_key_rejects_wrong_length() {
        let err = SymKey::from_slice(&[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 16,
                actual: 7
            }
        ));
    }

    #[test]
    fn test_sym_key_debug_is_redacted() {
        let key = SymKey::generate();
        assert_eq!(format!("{:?}", key), "SymKey(..)");
    }

    #[test]
    fn test_keypair_public_der_roundtrip() {
        let pair = RsaKeyPair::generate().unwrap();
        let parsed = public_key_from_der(pair.public_der()).unwrap();
        assert_eq!(parsed, RsaPublicKey::from(pair.private_key()));
    }

    #[test]
    fn test_public_key_from_garbage_fails() {
        let err = public_key_from_der(b"not a key").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPublicKey));
    }
}
