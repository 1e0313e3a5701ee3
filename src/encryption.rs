//! Password-based key derivation and authenticated vault encryption.
//!
//! A vault is a serialized keyring snapshot encrypted with AES-256-GCM
//! under a key derived from the user's password with PBKDF2-HMAC-SHA256.
//! The salt is bound into the encrypted structure so a vault is
//! self-describing: salt + password is everything needed to re-derive
//! the key on unlock.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyringError, Result};

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// PBKDF2 round count. Deliberately expensive; derivation happens once
/// per unlock and the derived key is cached until lock.
#[cfg(not(test))]
const PBKDF2_ROUNDS: u32 = 600_000;
#[cfg(test)]
const PBKDF2_ROUNDS: u32 = 1_000;

/// A symmetric key together with the salt it was derived from.
///
/// Held only in memory, only while the service is unlocked. The key
/// bytes are zeroized when the value is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SaltedKey {
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    salt: Vec<u8>,
}

impl SaltedKey {
    pub fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

/// The AEAD output of one vault encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherPayload {
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// An encrypted keyring snapshot, self-describing via its salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedVault {
    pub salt: Vec<u8>,
    pub cipher_payload: CipherPayload,
}

/// Derive a symmetric key from a password.
///
/// When no salt is supplied a fresh random one is generated. Same
/// password + same salt always yields the same key.
pub fn derive_symmetric_key(password: &str, salt: Option<&[u8]>) -> SaltedKey {
    let salt = match salt {
        Some(salt) => salt.to_vec(),
        None => {
            let mut salt = vec![0u8; SALT_LEN];
            OsRng.fill_bytes(&mut salt);
            salt
        }
    };

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);

    SaltedKey { key, salt }
}

/// Encrypt a serialized snapshot under a derived key.
///
/// A fresh random IV is used per call; the GCM tag is split off the
/// AEAD output and stored separately.
pub fn encrypt_vault(plaintext: &[u8], key: &SaltedKey) -> Result<EncryptedVault> {
    let cipher = Aes256Gcm::new_from_slice(key.key_bytes())
        .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;

    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| KeyringError::KeyDerivation("aead seal failed".into()))?;
    let auth_tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedVault {
        salt: key.salt().to_vec(),
        cipher_payload: CipherPayload {
            iv: iv.to_vec(),
            auth_tag,
            ciphertext: sealed,
        },
    })
}

/// Decrypt a vault. Fails with `DecryptionFailure` when the tag does
/// not verify, i.e. wrong password or corrupted data.
pub fn decrypt_vault(vault: &EncryptedVault, key: &SaltedKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.key_bytes())
        .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;

    let payload = &vault.cipher_payload;
    if payload.iv.len() != IV_LEN || payload.auth_tag.len() != TAG_LEN {
        return Err(KeyringError::DecryptionFailure);
    }
    let nonce = Nonce::from_slice(&payload.iv);

    let mut sealed = Vec::with_capacity(payload.ciphertext.len() + TAG_LEN);
    sealed.extend_from_slice(&payload.ciphertext);
    sealed.extend_from_slice(&payload.auth_tag);

    cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| KeyringError::DecryptionFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn derive_key_deterministic() {
        let k1 = derive_symmetric_key("hunter2", Some(&[0x42; SALT_LEN]));
        let k2 = derive_symmetric_key("hunter2", Some(&[0x42; SALT_LEN]));
        assert_eq!(k1.key_bytes(), k2.key_bytes());
    }

    #[test]
    fn derive_key_fresh_salt_when_omitted() {
        let k1 = derive_symmetric_key("hunter2", None);
        let k2 = derive_symmetric_key("hunter2", None);
        assert_ne!(k1.salt(), k2.salt());
        assert_ne!(k1.key_bytes(), k2.key_bytes());
        assert_eq!(k1.salt().len(), SALT_LEN);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = derive_symmetric_key("correct horse", None);
        let plaintext = b"[{\"id\":\"abc\"}]";

        let vault = encrypt_vault(plaintext, &key).unwrap();
        assert_eq!(vault.salt, key.salt());
        assert_eq!(vault.cipher_payload.iv.len(), IV_LEN);
        assert_eq!(vault.cipher_payload.auth_tag.len(), TAG_LEN);

        let decrypted = decrypt_vault(&vault, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn fresh_iv_per_call() {
        let key = derive_symmetric_key("pw", None);
        let a = encrypt_vault(b"same bytes", &key).unwrap();
        let b = encrypt_vault(b"same bytes", &key).unwrap();
        assert_ne!(a.cipher_payload.iv, b.cipher_payload.iv);
        assert_ne!(a.cipher_payload.ciphertext, b.cipher_payload.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = derive_symmetric_key("pw", None);
        let mut vault = encrypt_vault(b"snapshot", &key).unwrap();
        vault.cipher_payload.ciphertext[0] ^= 0xff;
        assert_matches!(
            decrypt_vault(&vault, &key),
            Err(KeyringError::DecryptionFailure)
        );
    }

    #[test]
    fn rederived_key_from_vault_salt_decrypts() {
        let key = derive_symmetric_key("pw", None);
        let vault = encrypt_vault(b"snapshot", &key).unwrap();
        drop(key);

        let rederived = derive_symmetric_key("pw", Some(&vault.salt));
        assert_eq!(decrypt_vault(&vault, &rederived).unwrap(), b"snapshot");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn wrong_password_never_decrypts(pw in "[a-zA-Z0-9 ]{1,24}", other in "[a-zA-Z0-9 ]{1,24}") {
            prop_assume!(pw != other);
            let key = derive_symmetric_key(&pw, Some(&[7u8; SALT_LEN]));
            let vault = encrypt_vault(b"secret snapshot", &key).unwrap();

            let wrong = derive_symmetric_key(&other, Some(&vault.salt));
            prop_assert!(matches!(
                decrypt_vault(&vault, &wrong),
                Err(KeyringError::DecryptionFailure)
            ));
        }
    }
}
