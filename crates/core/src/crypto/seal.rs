use super::keys::{public_key_from_der, SymKey};
use super::CryptoError;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes128;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// AES block size; also the length of the prepended IV
const IV_LEN: usize = 16;

/// Seal bytes under a circuit key: AES-128-CFB with a fresh IV prepended
pub fn seal_sym(key: &SymKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(IV_LEN + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);

    let cipher = Aes128CfbEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    cipher.encrypt(&mut out[IV_LEN..]);

    Ok(out)
}

/// Open a symmetric seal; the leading 16 bytes are the IV
pub fn open_sym(key: &SymKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_LEN {
        return Err(CryptoError::CiphertextTooShort);
    }

    let (iv, ciphertext) = sealed.split_at(IV_LEN);
    let mut out = ciphertext.to_vec();

    let cipher = Aes128CfbDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    cipher.decrypt(&mut out);

    Ok(out)
}

/// Seal bytes to a router's public key (PKCS#1 DER): RSA-OAEP with SHA-256
pub fn seal_asym(public_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let public = public_key_from_der(public_der)?;
    let mut rng = rand::thread_rng();

    public
        .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Open an asymmetric seal with the router's private key
pub fn open_asym(private: &RsaPrivateKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    private
        .decrypt(Oaep::new::<Sha256>(), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::RsaKeyPair;

    #[test]
    fn test_sym_roundtrip() {
        let key = SymKey::generate();
        let plaintext = b"through the layers";

        let sealed = seal_sym(&key, plaintext).unwrap();
        let opened = open_sym(&key, &sealed).unwrap();

        assert_eq!(opened, plaintext);
        assert_eq!(sealed.len(), IV_LEN + plaintext.len());
    }

    #[test]
    fn test_sym_fresh_iv_per_seal() {
        let key = SymKey::generate();
        let plaintext = b"same plaintext";

        let s1 = seal_sym(&key, plaintext).unwrap();
        let s2 = seal_sym(&key, plaintext).unwrap();

        // Fresh IV means fresh ciphertext every time
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_sym_wrong_key_garbles() {
        let sealed = seal_sym(&SymKey::generate(), b"sealed for one key").unwrap();
        let opened = open_sym(&SymKey::generate(), &sealed).unwrap();
        assert_ne!(opened, b"sealed for one key");
    }

    #[test]
    fn test_sym_short_ciphertext_rejected() {
        let err = open_sym(&SymKey::generate(), &[0u8; 5]).unwrap_err();
        assert!(matches!(err, CryptoError::CiphertextTooShort));
    }

    #[test]
    fn test_sym_empty_plaintext() {
        let key = SymKey::generate();
        let sealed = seal_sym(&key, b"").unwrap();
        assert_eq!(sealed.len(), IV_LEN);
        assert_eq!(open_sym(&key, &sealed).unwrap(), b"");
    }

    #[test]
    fn test_asym_roundtrip() {
        let pair = RsaKeyPair::generate().unwrap();
        let plaintext = b"a 16-byte circuit key fits easily";

        let sealed = seal_asym(pair.public_der(), plaintext).unwrap();
        let opened = open_asym(pair.private_key(), &sealed).unwrap();

        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_asym_tampered_ciphertext_fails() {
        let pair = RsaKeyPair::generate().unwrap();
        let mut sealed = seal_asym(pair.public_der(), b"payload").unwrap();
        sealed[10] ^= 0xff;

        let err = open_asym(pair.private_key(), &sealed).unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_asym_wrong_private_key_fails() {
        let sender_target = RsaKeyPair::generate().unwrap();
        let other = RsaKeyPair::generate().unwrap();

        let sealed = seal_asym(sender_target.public_der(), b"payload").unwrap();
        assert!(open_asym(other.private_key(), &sealed).is_err());
    }
}
