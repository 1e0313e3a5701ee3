//! Key-custody core for an HD wallet.
//!
//! This crate owns all private key material: it derives and manages
//! hierarchical-deterministic keyrings, encrypts them at rest under a
//! user password, and is the sole authority permitted to produce a
//! signed transaction. Surrounding layers (UI, app state, RPC, fee
//! estimation) are external collaborators that interact only through
//! [`KeyringService`] operations, the [`VaultStore`] boundary, and the
//! [`KeyringEvent`] stream.

pub mod derivation;
pub mod encryption;
pub mod error;
pub mod keyring;
pub mod service;
pub mod transaction;
pub mod vault_store;

pub use encryption::{
    decrypt_vault, derive_symmetric_key, encrypt_vault, EncryptedVault, SaltedKey,
};
pub use error::{KeyringError, Result};
pub use keyring::{HdKeyring, KeyringType, KeyringView, SerializedKeyring};
pub use service::{KeyringEvent, KeyringService};
pub use transaction::{
    Eip1559TransactionRequest, LegacyTransactionRequest, SignedEvmTransaction,
    TypedTransactionRequest,
};
pub use vault_store::{FileVaultStore, MemoryVaultStore, VaultRecord, VaultStore};
