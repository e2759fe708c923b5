//! Payload encryption
//!
//! [`Cipher`] is the capability the producer seals payloads with.
//! [`AesGcmCipher`] derives 256-bit keys with Argon2id and encrypts with
//! AES-256-GCM. Its output is `iv || ciphertext+tag`, so a sealed payload can
//! be opened with the key alone.

use std::fmt;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{IngestError, IngestResult};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const MIN_SALT_LEN: usize = 8;

pub type Iv = [u8; IV_LEN];

/// Derived key material, wiped on drop
#[derive(Clone)]
pub struct SecretKey(Zeroizing<[u8; KEY_LEN]>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

pub trait Cipher: Send + Sync {
    fn derive_key(&self, passphrase: &[u8], salt: &[u8]) -> IngestResult<SecretKey>;

    fn generate_iv(&self) -> Iv;

    fn encrypt(&self, key: &SecretKey, iv: &Iv, plaintext: &[u8]) -> IngestResult<Vec<u8>>;

    /// Open bytes produced by [`Cipher::encrypt`]
    fn decrypt(&self, key: &SecretKey, bytes: &[u8]) -> IngestResult<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AesGcmCipher;

impl Cipher for AesGcmCipher {
    fn derive_key(&self, passphrase: &[u8], salt: &[u8]) -> IngestResult<SecretKey> {
        if passphrase.is_empty() {
            return Err(IngestError::Crypto("passphrase must not be empty".into()));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(IngestError::Crypto(format!(
                "salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::default()
            .hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|e| IngestError::Crypto(format!("key derivation failed: {}", e)))?;
        Ok(SecretKey(key))
    }

    fn generate_iv(&self) -> Iv {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        iv
    }

    fn encrypt(&self, key: &SecretKey, iv: &Iv, plaintext: &[u8]) -> IngestResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| IngestError::Crypto(format!("invalid key: {}", e)))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .map_err(|e| IngestError::Crypto(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(IV_LEN + sealed.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, key: &SecretKey, bytes: &[u8]) -> IngestResult<Vec<u8>> {
        if bytes.len() < IV_LEN {
            return Err(IngestError::Crypto("ciphertext shorter than IV".into()));
        }
        let (iv, sealed) = bytes.split_at(IV_LEN);
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| IngestError::Crypto(format!("invalid key: {}", e)))?;
        cipher
            .decrypt(Nonce::from_slice(iv), sealed)
            .map_err(|e| IngestError::Crypto(format!("decryption failed: {}", e)))
    }
}

/// A cipher bound to one derived key
#[derive(Clone)]
pub struct Sealer {
    cipher: Arc<dyn Cipher>,
    key: SecretKey,
}

impl Sealer {
    /// Derive the key once; `passphrase` and `salt` are wiped when dropped here
    pub fn derive(
        cipher: Arc<dyn Cipher>,
        passphrase: Zeroizing<String>,
        salt: Zeroizing<String>,
    ) -> IngestResult<Self> {
        let key = cipher.derive_key(passphrase.as_bytes(), salt.as_bytes())?;
        drop(passphrase);
        drop(salt);
        Ok(Self { cipher, key })
    }

    pub fn with_key(cipher: Arc<dyn Cipher>, key: SecretKey) -> Self {
        Self { cipher, key }
    }

    /// Encrypt under a fresh IV
    pub fn seal(&self, plaintext: &[u8]) -> IngestResult<Vec<u8>> {
        let iv = self.cipher.generate_iv();
        self.cipher.encrypt(&self.key, &iv, plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> IngestResult<Vec<u8>> {
        self.cipher.decrypt(&self.key, sealed)
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sealer() -> Sealer {
        Sealer::derive(
            Arc::new(AesGcmCipher),
            Zeroizing::new("correct horse".to_string()),
            Zeroizing::new("pepper-salt".to_string()),
        )
        .unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let sealer = sealer();
        let sealed = sealer.seal(b"a,b,c\n1,2,3").unwrap();
        assert_eq!(sealed.len(), IV_LEN + 11 + 16);
        assert_eq!(sealer.open(&sealed).unwrap(), b"a,b,c\n1,2,3");
    }

    #[test]
    fn test_fresh_iv_per_seal() {
        let sealer = sealer();
        assert_ne!(sealer.seal(b"same").unwrap(), sealer.seal(b"same").unwrap());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let cipher = AesGcmCipher;
        let a = cipher.derive_key(b"pass", b"saltsalt").unwrap();
        let b = cipher.derive_key(b"pass", b"saltsalt").unwrap();
        let c = cipher.derive_key(b"pass", b"saltsalT").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_rejects_weak_inputs_and_tampering() {
        let cipher = AesGcmCipher;
        assert!(cipher.derive_key(b"pass", b"short").is_err());
        assert!(cipher.derive_key(b"", b"saltsalt").is_err());

        let sealer = sealer();
        let mut sealed = sealer.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(sealer.open(&sealed), Err(IngestError::Crypto(_))));
        assert!(sealer.open(&[0u8; 4]).is_err());
    }
}
