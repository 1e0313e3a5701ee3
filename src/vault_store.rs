//! Append-only persistence of encrypted vault snapshots.
//!
//! The core never mutates or deletes a persisted record; the most
//! recently appended record is the one consulted on unlock, earlier
//! records are retained as history. The underlying medium is opaque —
//! implementations only promise durability before `append_vault`
//! returns.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::encryption::EncryptedVault;
use crate::error::{KeyringError, Result};

/// One persisted snapshot with its append timestamp (ms since epoch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    pub timestamp: u64,
    pub vault: EncryptedVault,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Byte-level storage boundary for encrypted vaults.
///
/// Implementations never see plaintext key material. Failures surface
/// as `StorageUnavailable`; retry policy belongs to the caller's side
/// of the boundary, not here.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// All persisted records in append order; the last is authoritative.
    async fn read_latest_vaults(&self) -> Result<Vec<VaultRecord>>;

    /// Durably append one record. Must not return before the record
    /// would survive a process crash.
    async fn append_vault(&self, vault: EncryptedVault) -> Result<()>;
}

/// In-memory store for tests and hosts that bring their own persistence.
#[derive(Default)]
pub struct MemoryVaultStore {
    records: Mutex<Vec<VaultRecord>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn read_latest_vaults(&self) -> Result<Vec<VaultRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| KeyringError::StorageUnavailable("store poisoned".into()))?
            .clone())
    }

    async fn append_vault(&self, vault: EncryptedVault) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| KeyringError::StorageUnavailable("store poisoned".into()))?
            .push(VaultRecord {
                timestamp: now_millis(),
                vault,
            });
        Ok(())
    }
}

/// File-backed store: a single JSON file holding the record history.
///
/// Appends rewrite the file via a temp file + rename and fsync, so a
/// torn write never corrupts the previous history.
pub struct FileVaultStore {
    path: PathBuf,
}

impl FileVaultStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn read_records(&self) -> Result<Vec<VaultRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| KeyringError::StorageUnavailable(format!("corrupt vault file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(KeyringError::StorageUnavailable(e.to_string())),
        }
    }
}

#[async_trait]
impl VaultStore for FileVaultStore {
    async fn read_latest_vaults(&self) -> Result<Vec<VaultRecord>> {
        self.read_records().await
    }

    async fn append_vault(&self, vault: EncryptedVault) -> Result<()> {
        let mut records = self.read_records().await?;
        records.push(VaultRecord {
            timestamp: now_millis(),
            vault,
        });

        let bytes = serde_json::to_vec(&records)?;
        let tmp = self.path.with_extension("tmp");

        let map_io = |e: std::io::Error| KeyringError::StorageUnavailable(e.to_string());
        let mut file = tokio::fs::File::create(&tmp).await.map_err(map_io)?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
            .await
            .map_err(map_io)?;
        file.sync_all().await.map_err(map_io)?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await.map_err(map_io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{derive_symmetric_key, encrypt_vault};

    fn sample_vault(tag: &[u8]) -> EncryptedVault {
        let key = derive_symmetric_key("pw", Some(&[1u8; 16]));
        encrypt_vault(tag, &key).unwrap()
    }

    #[tokio::test]
    async fn memory_store_appends_in_order() {
        let store = MemoryVaultStore::new();
        let first = sample_vault(b"first");
        let second = sample_vault(b"second");

        store.append_vault(first.clone()).await.unwrap();
        store.append_vault(second.clone()).await.unwrap();

        let records = store.read_latest_vaults().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vault, first);
        assert_eq!(records.last().unwrap().vault, second);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaults.json");

        let store = FileVaultStore::new(&path);
        assert!(store.read_latest_vaults().await.unwrap().is_empty());

        let vault = sample_vault(b"persisted");
        store.append_vault(vault.clone()).await.unwrap();
        drop(store);

        let reopened = FileVaultStore::new(&path);
        let records = reopened.read_latest_vaults().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vault, vault);
    }

    #[tokio::test]
    async fn file_store_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileVaultStore::new(dir.path().join("vaults.json"));

        for i in 0..3u8 {
            store.append_vault(sample_vault(&[i])).await.unwrap();
        }
        let records = store.read_latest_vaults().await.unwrap();
        assert_eq!(records.len(), 3);
    }
}
