use bitcoin_hashes::{hash160, Hash};
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::Sha512;

use crate::error::{KeyringError, Result};

const HARDENED_BIT: u32 = 0x80000000;

/// A BIP32 extended key: private/public pair plus chain code.
#[derive(Clone)]
pub struct ExtendedKey {
    pub private_key: SecretKey,
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
}

impl ExtendedKey {
    /// Master key from a BIP39 seed, per the BIP32 "Bitcoin seed" HMAC.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let secp = Secp256k1::new();

        let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;
        hmac.update(seed);
        let digest = hmac.finalize().into_bytes();

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..64]);

        let private_key = SecretKey::from_slice(&digest[0..32])
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;
        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth: 0,
        })
    }

    /// Derive the child key at `index` (hardened when the high bit is set).
    pub fn derive_child(&self, index: u32) -> Result<Self> {
        let secp = Secp256k1::new();

        // 33 bytes of key material + 4 bytes of index
        let mut data = Vec::with_capacity(37);
        if index & HARDENED_BIT != 0 {
            data.push(0);
            data.extend_from_slice(&self.private_key[..]);
        } else {
            data.extend_from_slice(&self.public_key.serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let mut hmac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;
        hmac.update(&data);
        let digest = hmac.finalize().into_bytes();

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..64]);

        let tweak = SecretKey::from_slice(&digest[0..32])
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;
        let private_key = self
            .private_key
            .add_tweak(&tweak.into())
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;
        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth: self.depth + 1,
        })
    }

    /// HASH160 fingerprint of the compressed public key.
    pub fn fingerprint(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        let hash = hash160::Hash::hash(&self.public_key.serialize());
        out.copy_from_slice(&hash[0..4]);
        out
    }
}

/// A parsed BIP32 derivation path such as `m/44'/60'/0'/0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    indices: Vec<u32>,
}

impl DerivationPath {
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('m') {
            return Err(KeyringError::KeyDerivation(format!(
                "derivation path must start with 'm': {path}"
            )));
        }

        let indices = path
            .split('/')
            .skip(1)
            .filter(|s| !s.is_empty())
            .map(|component| {
                let hardened = component.ends_with('\'') || component.ends_with('h');
                let digits = if hardened {
                    &component[..component.len() - 1]
                } else {
                    component
                };
                digits
                    .parse::<u32>()
                    .map(|index| if hardened { index | HARDENED_BIT } else { index })
                    .map_err(|_| {
                        KeyringError::KeyDerivation(format!("bad path component: {component}"))
                    })
            })
            .collect::<Result<Vec<u32>>>()?;

        Ok(DerivationPath { indices })
    }

    /// Walk the path from `root`, child by child.
    pub fn derive(&self, root: &ExtendedKey) -> Result<ExtendedKey> {
        let mut key = root.clone();
        for &index in &self.indices {
            key = key.derive_child(index)?;
        }
        Ok(key)
    }
}

/// BIP44 account node for Ethereum: `m/44'/60'/0'/0`. Address keys are
/// non-hardened children of this node, one per account index.
pub const ETHEREUM_ACCOUNT_PATH: &str = "m/44'/60'/0'/0";

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 64] = [7u8; 64];

    #[test]
    fn master_key_deterministic() {
        let a = ExtendedKey::from_seed(&SEED).unwrap();
        let b = ExtendedKey::from_seed(&SEED).unwrap();
        assert_eq!(a.private_key, b.private_key);
        assert_eq!(a.chain_code, b.chain_code);
    }

    #[test]
    fn child_keys_differ_by_index() {
        let root = ExtendedKey::from_seed(&SEED).unwrap();
        let c0 = root.derive_child(0).unwrap();
        let c1 = root.derive_child(1).unwrap();
        assert_ne!(c0.private_key, c1.private_key);
        assert_ne!(c0.private_key, root.private_key);
        assert_eq!(c0.depth, 1);
    }

    #[test]
    fn hardened_differs_from_normal() {
        let root = ExtendedKey::from_seed(&SEED).unwrap();
        let normal = root.derive_child(0).unwrap();
        let hardened = root.derive_child(HARDENED_BIT).unwrap();
        assert_ne!(normal.private_key, hardened.private_key);
    }

    #[test]
    fn path_parse_and_walk() {
        let path = DerivationPath::parse(ETHEREUM_ACCOUNT_PATH).unwrap();
        let root = ExtendedKey::from_seed(&SEED).unwrap();
        let node = path.derive(&root).unwrap();
        assert_eq!(node.depth, 4);

        // stepwise walk matches the path walk
        let manual = root
            .derive_child(44 | HARDENED_BIT)
            .unwrap()
            .derive_child(60 | HARDENED_BIT)
            .unwrap()
            .derive_child(HARDENED_BIT)
            .unwrap()
            .derive_child(0)
            .unwrap();
        assert_eq!(node.private_key, manual.private_key);
    }

    #[test]
    fn path_parse_rejects_garbage() {
        assert!(DerivationPath::parse("44'/60'").is_err());
        assert!(DerivationPath::parse("m/44'/x'").is_err());
    }
}
