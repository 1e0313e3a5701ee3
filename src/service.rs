//! Keyring lifecycle orchestrator.
//!
//! Owns every secret in the system: the password-derived vault key and
//! the in-memory HD keyrings. All mutable state sits behind a single
//! async mutex that is held across each mutate-then-persist sequence,
//! so concurrent operations serialize and the persisted vault history
//! stays a gap-free sequence of full snapshots.
//!
//! Results of keyring mutations and signing reach the rest of the
//! system only through the event channel handed out at construction;
//! the direct return values carry ids and precondition errors.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::encryption::{decrypt_vault, derive_symmetric_key, encrypt_vault, SaltedKey};
use crate::error::{KeyringError, Result};
use crate::keyring::{HdKeyring, KeyringType, KeyringView, SerializedKeyring};
use crate::transaction::{parse_signed_transaction, SignedEvmTransaction, TypedTransactionRequest};
use crate::vault_store::VaultStore;

/// Domain events consumed by the external state layer.
#[derive(Debug, Clone)]
pub enum KeyringEvent {
    /// Lock state changed; `true` means locked.
    Locked(bool),
    /// The keyring set changed; full secret-free view of every keyring.
    Keyrings(Vec<KeyringView>),
    /// A newly derived address.
    Address(String),
    /// A completed, verified signed transaction.
    SignedTx(SignedEvmTransaction),
}

/// The cached key exists if and only if the service is unlocked: the
/// `Unlocked` variant is the only place it (or a keyring) can live, so
/// locked code paths cannot reference either.
enum LockState {
    Locked,
    Unlocked {
        cached_key: SaltedKey,
        keyrings: Vec<HdKeyring>,
    },
}

pub struct KeyringService {
    store: Arc<dyn VaultStore>,
    state: Mutex<LockState>,
    events: mpsc::UnboundedSender<KeyringEvent>,
}

impl KeyringService {
    /// Create a service around a vault store. The returned receiver is
    /// the only channel through which mutation results are observable.
    pub fn new(store: Arc<dyn VaultStore>) -> (Self, mpsc::UnboundedReceiver<KeyringEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            KeyringService {
                store,
                state: Mutex::new(LockState::Locked),
                events,
            },
            receiver,
        )
    }

    pub async fn is_locked(&self) -> bool {
        matches!(*self.state.lock().await, LockState::Locked)
    }

    /// Secret-free view of the active keyring set, in insertion order.
    pub async fn keyrings(&self) -> Vec<KeyringView> {
        match &*self.state.lock().await {
            LockState::Locked => Vec::new(),
            LockState::Unlocked { keyrings, .. } => views(keyrings),
        }
    }

    /// Unlock the service.
    ///
    /// With a prior vault present (and `force_new_vault` false) the key
    /// is derived from the stored salt and the latest vault decrypted;
    /// a failed decrypt is the expected wrong-password path and returns
    /// `Ok(false)` with the service still locked. With no prior vault,
    /// or when forcing, a brand-new salt and empty vault are persisted.
    pub async fn unlock(&self, password: &str, force_new_vault: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        if matches!(*state, LockState::Unlocked { .. }) {
            return Err(KeyringError::AlreadyUnlocked);
        }
        self.unlock_in_place(&mut state, password, force_new_vault)
            .await
    }

    /// Discard the cached key and all in-memory keyrings. Idempotent.
    pub async fn lock(&self) {
        let mut state = self.state.lock().await;
        *state = LockState::Locked;
        debug!("keyring service locked");
        self.emit(KeyringEvent::Locked(true));
        self.emit(KeyringEvent::Keyrings(Vec::new()));
    }

    /// Lifecycle hook for service shutdown: drop all secrets.
    pub async fn shutdown(&self) {
        self.lock().await;
    }

    /// Generate a fresh 256-bit HD keyring, persist the new snapshot,
    /// derive its first account, and emit `Address` + `Keyrings`.
    /// Returns the new keyring's id.
    pub async fn generate_new_keyring(
        &self,
        keyring_type: KeyringType,
        password: Option<&str>,
    ) -> Result<String> {
        if keyring_type != KeyringType::MnemonicBip39S256 {
            return Err(KeyringError::UnsupportedKeyringType);
        }
        let keyring = HdKeyring::generate()?;
        self.install_keyring(keyring, password).await
    }

    /// Import a legacy 12-word (128-bit) keyring. Behaves like
    /// generation once the word count checks out.
    pub async fn import_legacy_keyring(
        &self,
        mnemonic: &str,
        password: Option<&str>,
    ) -> Result<String> {
        // 12 words for a 128-bit seed + checksum; deeper validation is
        // the keyring's job.
        if mnemonic.split_whitespace().count() != 12 {
            return Err(KeyringError::InvalidMnemonic);
        }
        let keyring = HdKeyring::from_mnemonic(mnemonic)?;
        self.install_keyring(keyring, password).await
    }

    /// Sign an EIP-1559 transaction with the first keyring holding
    /// `address`. The verified result is delivered via the `SignedTx`
    /// event, never as a return value.
    pub async fn sign_transaction(
        &self,
        address: &str,
        request: &TypedTransactionRequest,
    ) -> Result<()> {
        let state = self.state.lock().await;
        let LockState::Unlocked { keyrings, .. } = &*state else {
            return Err(KeyringError::RequiresUnlock);
        };

        let request = match request {
            TypedTransactionRequest::Eip1559(request) => request,
            TypedTransactionRequest::Legacy(_) => {
                return Err(KeyringError::UnsupportedTransactionType)
            }
        };

        // Linear scan in insertion order; first keyring wins.
        let keyring = keyrings
            .iter()
            .find(|k| k.has_account(address))
            .ok_or_else(|| KeyringError::KeyringAccountNotFound(address.to_string()))?;

        let raw = keyring.sign_transaction(address, request)?;
        let signed = parse_signed_transaction(&raw)?;
        if !signed.from.eq_ignore_ascii_case(address) {
            return Err(KeyringError::SigningIncomplete(
                "recovered sender does not match the requested account".into(),
            ));
        }

        debug!(from = %signed.from, hash = %signed.hash, "transaction signed");
        self.emit(KeyringEvent::SignedTx(signed));
        Ok(())
    }

    // Shared tail of generate/import: optional implicit unlock, then
    // derive first account → persist a snapshot including the candidate
    // → append on success → emit. The mutex stays held throughout, so
    // the append and persist of two concurrent calls cannot interleave,
    // and a failed (or abandoned) persist leaves the active set
    // untouched.
    async fn install_keyring(
        &self,
        mut keyring: HdKeyring,
        password: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(password) = password {
            if matches!(*state, LockState::Locked) {
                self.unlock_in_place(&mut state, password, false).await?;
            }
        }
        if matches!(*state, LockState::Locked) {
            return Err(KeyringError::RequiresUnlock);
        }

        let id = keyring.id().to_string();
        let address = keyring
            .derive_accounts(1)?
            .pop()
            .ok_or_else(|| KeyringError::KeyDerivation("no account derived".into()))?;

        let LockState::Unlocked {
            cached_key,
            keyrings,
        } = &mut *state
        else {
            unreachable!("checked above");
        };
        let mut snapshots: Vec<SerializedKeyring> =
            keyrings.iter().map(|k| k.serialize()).collect();
        snapshots.push(keyring.serialize());
        self.persist_snapshot(cached_key, snapshots).await?;
        keyrings.push(keyring);

        debug!(%id, "keyring installed");
        self.emit(KeyringEvent::Address(address));
        self.emit_keyrings(&state);
        Ok(id)
    }

    // Unlock logic shared by `unlock` and the implicit-unlock path.
    // Expects `state` to be `Locked`; replaces it wholesale on success
    // only, so an abandoned call leaves nothing half-set.
    async fn unlock_in_place(
        &self,
        state: &mut LockState,
        password: &str,
        force_new_vault: bool,
    ) -> Result<bool> {
        if !force_new_vault {
            let records = self.store.read_latest_vaults().await?;
            if let Some(record) = records.last() {
                let cached_key =
                    derive_key_off_thread(password, Some(record.vault.salt.clone())).await?;
                let plaintext = match decrypt_vault(&record.vault, &cached_key) {
                    Ok(plaintext) => plaintext,
                    Err(KeyringError::DecryptionFailure) => {
                        warn!("vault decryption failed; wrong password or corrupt vault");
                        return Ok(false);
                    }
                    Err(other) => return Err(other),
                };

                let snapshots: Vec<SerializedKeyring> = serde_json::from_slice(&plaintext)?;
                let keyrings = snapshots
                    .iter()
                    .map(HdKeyring::deserialize)
                    .collect::<Result<Vec<_>>>()?;

                *state = LockState::Unlocked {
                    cached_key,
                    keyrings,
                };
                debug!("keyring service unlocked from persisted vault");
                self.emit(KeyringEvent::Locked(false));
                self.emit_keyrings(state);
                return Ok(true);
            }
        }

        // No prior vault, or a forced fresh one: new salt, empty vault.
        // Persist first, assign after, so a failed or abandoned call
        // leaves the service cleanly locked.
        let fresh = LockState::Unlocked {
            cached_key: derive_key_off_thread(password, None).await?,
            keyrings: Vec::new(),
        };
        self.persist_keyrings(&fresh).await?;
        *state = fresh;
        debug!("keyring service unlocked with a fresh vault");
        self.emit(KeyringEvent::Locked(false));
        self.emit_keyrings(state);
        Ok(true)
    }

    // Serialize every active keyring and persist.
    async fn persist_keyrings(&self, state: &LockState) -> Result<()> {
        let LockState::Unlocked {
            cached_key,
            keyrings,
        } = state
        else {
            return Err(KeyringError::RequiresUnlock);
        };
        let snapshots = keyrings.iter().map(|k| k.serialize()).collect();
        self.persist_snapshot(cached_key, snapshots).await
    }

    // Sort the snapshot by id (persisted byte layout only; runtime
    // selection order stays insertion order), encrypt under the cached
    // key, and append.
    async fn persist_snapshot(
        &self,
        cached_key: &SaltedKey,
        mut snapshots: Vec<SerializedKeyring>,
    ) -> Result<()> {
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        let plaintext = serde_json::to_vec(&snapshots)?;
        let vault = encrypt_vault(&plaintext, cached_key)?;
        self.store.append_vault(vault).await
    }

    fn emit_keyrings(&self, state: &LockState) {
        let keyrings = match state {
            LockState::Locked => Vec::new(),
            LockState::Unlocked { keyrings, .. } => views(keyrings),
        };
        self.emit(KeyringEvent::Keyrings(keyrings));
    }

    fn emit(&self, event: KeyringEvent) {
        if self.events.send(event).is_err() {
            debug!("keyring event dropped; no subscriber");
        }
    }
}

// The KDF is deliberately expensive; run it on the blocking pool so it
// does not stall the executor thread for the duration.
async fn derive_key_off_thread(password: &str, salt: Option<Vec<u8>>) -> Result<SaltedKey> {
    let password = password.to_owned();
    tokio::task::spawn_blocking(move || derive_symmetric_key(&password, salt.as_deref()))
        .await
        .map_err(|e| KeyringError::KeyDerivation(e.to_string()))
}

fn views(keyrings: &[HdKeyring]) -> Vec<KeyringView> {
    keyrings
        .iter()
        .map(|k| KeyringView {
            id: k.id().to_string(),
            keyring_type: k.keyring_type(),
            addresses: k.accounts(),
        })
        .collect()
}
