use thiserror::Error;

/// Every failure the custody core can report.
///
/// Validation and state-precondition errors never partially mutate
/// service state; storage failures are surfaced, not retried here.
#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("keyring service is already unlocked")]
    AlreadyUnlocked,

    #[error("keyring service must be unlocked")]
    RequiresUnlock,

    /// Wrong password or corrupted vault. The authentication tag is the
    /// only wrong-password detector; there is no separate check.
    #[error("vault decryption failed")]
    DecryptionFailure,

    #[error("invalid mnemonic phrase")]
    InvalidMnemonic,

    #[error("only 256-bit HD key trees are supported")]
    UnsupportedKeyringType,

    #[error("no keyring holds account {0}")]
    KeyringAccountNotFound(String),

    #[error("only EIP-1559 transaction requests can be signed")]
    UnsupportedTransactionType,

    #[error("signed transaction is incomplete: {0}")]
    SigningIncomplete(String),

    #[error("vault storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for KeyringError {
    fn from(err: serde_json::Error) -> Self {
        KeyringError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeyringError>;
