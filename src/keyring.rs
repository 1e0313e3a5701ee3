//! In-memory HD keyring: one BIP39 mnemonic, one BIP44 key tree,
//! monotone account derivation, and raw transaction signing.
//!
//! A keyring never leaves the custody core. Collaborators only ever see
//! the [`KeyringView`] projection, which carries no secret material.

use alloy::consensus::{SignableTransaction, TxEnvelope};
use alloy::eips::eip2718::Encodable2718;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use bip39::Mnemonic;
use rand::{rngs::OsRng, RngCore};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::derivation::{DerivationPath, ExtendedKey, ETHEREUM_ACCOUNT_PATH};
use crate::error::{KeyringError, Result};
use crate::transaction::Eip1559TransactionRequest;

/// Supported keyring flavors. The orchestrator only generates 256-bit
/// trees; the 128-bit variant exists for legacy imports and as the
/// extension point for future key sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyringType {
    MnemonicBip39S128,
    MnemonicBip39S256,
}

/// Public, secret-free view of one keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringView {
    pub id: String,
    pub keyring_type: KeyringType,
    pub addresses: Vec<String>,
}

/// Plaintext snapshot of one keyring. Only ever serialized inside an
/// encrypted vault payload; never written out in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedKeyring {
    pub version: u32,
    pub id: String,
    pub mnemonic: String,
    pub path: String,
    pub account_count: usize,
}

struct DerivedAccount {
    address: String,
    key: SecretKey,
}

pub struct HdKeyring {
    id: String,
    mnemonic: Mnemonic,
    path: String,
    account_node: ExtendedKey,
    accounts: Vec<DerivedAccount>,
}

impl HdKeyring {
    /// Generate a keyring from fresh 256-bit entropy (24 words).
    pub fn generate() -> Result<Self> {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        let mnemonic =
            Mnemonic::from_entropy(&entropy).map_err(|_| KeyringError::InvalidMnemonic)?;
        Self::from_parts(mnemonic, ETHEREUM_ACCOUNT_PATH)
    }

    /// Reconstruct a keyring from an existing phrase. The phrase must
    /// decode to a well-formed word sequence of a valid length class.
    pub fn from_mnemonic(phrase: &str) -> Result<Self> {
        let mnemonic =
            Mnemonic::parse_normalized(phrase).map_err(|_| KeyringError::InvalidMnemonic)?;
        Self::from_parts(mnemonic, ETHEREUM_ACCOUNT_PATH)
    }

    fn from_parts(mnemonic: Mnemonic, path: &str) -> Result<Self> {
        let seed = mnemonic.to_seed("");
        let root = ExtendedKey::from_seed(&seed)?;
        let account_node = DerivationPath::parse(path)?.derive(&root)?;

        // Deterministic id: fingerprint of the account-level node, so the
        // same mnemonic reconstructs the same id across lock cycles.
        let id = hex::encode(account_node.fingerprint());

        Ok(HdKeyring {
            id,
            mnemonic,
            path: path.to_string(),
            account_node,
            accounts: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keyring_type(&self) -> KeyringType {
        if self.mnemonic.word_count() == 12 {
            KeyringType::MnemonicBip39S128
        } else {
            KeyringType::MnemonicBip39S256
        }
    }

    /// All addresses issued so far, in derivation order.
    pub fn accounts(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.address.clone()).collect()
    }

    pub fn has_account(&self, address: &str) -> bool {
        self.accounts
            .iter()
            .any(|a| a.address.eq_ignore_ascii_case(address))
    }

    /// Derive the next `n` addresses along this keyring's path, in
    /// increasing index order. Already-issued indices are never
    /// re-derived; repeated calls continue where the last one stopped.
    pub fn derive_accounts(&mut self, n: usize) -> Result<Vec<String>> {
        let start = self.accounts.len();
        let mut issued = Vec::with_capacity(n);
        for index in start..start + n {
            let child = self.account_node.derive_child(index as u32)?;
            let address = ethereum_address(&child);
            self.accounts.push(DerivedAccount {
                address: address.clone(),
                key: child.private_key,
            });
            issued.push(address);
        }
        Ok(issued)
    }

    /// Snapshot for vault persistence. `deserialize` of the result
    /// reproduces identical id and derivable accounts.
    pub fn serialize(&self) -> SerializedKeyring {
        SerializedKeyring {
            version: 1,
            id: self.id.clone(),
            mnemonic: self.mnemonic.to_string(),
            path: self.path.clone(),
            account_count: self.accounts.len(),
        }
    }

    pub fn deserialize(snapshot: &SerializedKeyring) -> Result<Self> {
        let mnemonic = Mnemonic::parse_normalized(&snapshot.mnemonic)
            .map_err(|_| KeyringError::InvalidMnemonic)?;
        let mut keyring = Self::from_parts(mnemonic, &snapshot.path)?;
        keyring.derive_accounts(snapshot.account_count)?;
        Ok(keyring)
    }

    /// Sign an EIP-1559 request with the key behind `address` and return
    /// the raw EIP-2718 envelope bytes.
    pub fn sign_transaction(
        &self,
        address: &str,
        request: &Eip1559TransactionRequest,
    ) -> Result<Vec<u8>> {
        let account = self
            .accounts
            .iter()
            .find(|a| a.address.eq_ignore_ascii_case(address))
            .ok_or_else(|| KeyringError::KeyringAccountNotFound(address.to_string()))?;

        let signer = PrivateKeySigner::from_slice(&account.key.secret_bytes())
            .map_err(|e| KeyringError::KeyDerivation(e.to_string()))?;

        let tx = request.to_unsigned();
        let signature = signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| KeyringError::SigningIncomplete(e.to_string()))?;

        let envelope = TxEnvelope::Eip1559(tx.into_signed(signature));
        let mut raw = Vec::new();
        envelope.encode_2718(&mut raw);
        Ok(raw)
    }
}

/// Lowercase 0x-prefixed Ethereum address: keccak-256 of the
/// uncompressed public key, last 20 bytes.
fn ethereum_address(key: &ExtendedKey) -> String {
    let uncompressed = key.public_key.serialize_uncompressed();
    let hash = keccak_hash::keccak(&uncompressed[1..]);
    format!("0x{}", hex::encode(&hash.as_bytes()[12..32]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::parse_signed_transaction;
    use alloy::primitives::{Address, Bytes, U256};
    use assert_matches::assert_matches;

    const TEST_PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn request() -> Eip1559TransactionRequest {
        Eip1559TransactionRequest {
            chain_id: 1,
            nonce: 0,
            max_priority_fee_per_gas: 1_000_000_000,
            max_fee_per_gas: 20_000_000_000,
            gas_limit: 21_000,
            to: Address::repeat_byte(0x22),
            value: U256::from(1u64),
            input: Bytes::new(),
        }
    }

    #[test]
    fn generate_yields_24_words() {
        let keyring = HdKeyring::generate().unwrap();
        assert_eq!(keyring.serialize().mnemonic.split(' ').count(), 24);
        assert_eq!(keyring.keyring_type(), KeyringType::MnemonicBip39S256);
    }

    #[test]
    fn known_vector_first_address() {
        let mut keyring = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();
        let issued = keyring.derive_accounts(1).unwrap();
        // BIP44 m/44'/60'/0'/0/0 for the standard test phrase
        assert_eq!(issued[0], "0x9858effd232b4033e47d90003d41ec34ecaeda94");
    }

    #[test]
    fn derivation_order_is_stable() {
        let mut a = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();
        let mut b = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();

        let mut split = a.derive_accounts(3).unwrap();
        split.extend(a.derive_accounts(2).unwrap());
        let whole = b.derive_accounts(5).unwrap();

        assert_eq!(split, whole);
        assert_eq!(split.len(), 5);
        let unique: std::collections::HashSet<_> = split.iter().collect();
        assert_eq!(unique.len(), 5);
        assert_eq!(a.accounts(), whole);
    }

    #[test]
    fn malformed_phrase_rejected() {
        assert!(matches!(
            HdKeyring::from_mnemonic("abandon abandon zebra"),
            Err(KeyringError::InvalidMnemonic)
        ));
    }

    #[test]
    fn serialize_roundtrip_preserves_id_and_accounts() {
        let mut original = HdKeyring::generate().unwrap();
        original.derive_accounts(3).unwrap();

        let snapshot = original.serialize();
        let restored = HdKeyring::deserialize(&snapshot).unwrap();

        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.accounts(), original.accounts());
    }

    #[test]
    fn sign_requires_known_account() {
        let mut keyring = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();
        keyring.derive_accounts(1).unwrap();
        assert_matches!(
            keyring.sign_transaction("0x0000000000000000000000000000000000000001", &request()),
            Err(KeyringError::KeyringAccountNotFound(_))
        );
    }

    #[test]
    fn sign_is_case_insensitive_on_address() {
        let mut keyring = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();
        let address = keyring.derive_accounts(1).unwrap().remove(0);
        let upper = address.to_uppercase().replace("0X", "0x");
        assert!(keyring.sign_transaction(&upper, &request()).is_ok());
    }

    #[test]
    fn signed_bytes_decode_to_the_signer() {
        let mut keyring = HdKeyring::from_mnemonic(TEST_PHRASE).unwrap();
        let address = keyring.derive_accounts(1).unwrap().remove(0);

        let raw = keyring.sign_transaction(&address, &request()).unwrap();
        let signed = parse_signed_transaction(&raw).unwrap();

        assert_eq!(signed.from, address);
        assert_eq!(signed.tx_type, 2);
        assert_eq!(signed.nonce, 0);
        assert_eq!(signed.max_fee_per_gas, 20_000_000_000);
        assert!(signed.block_hash.is_none());
    }
}
