//! Walkthrough of the custody lifecycle: unlock a fresh vault, generate
//! a keyring, sign a transaction, lock, and unlock again from disk.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, U256};
use custodian::{
    Eip1559TransactionRequest, FileVaultStore, KeyringEvent, KeyringService, KeyringType,
    TypedTransactionRequest,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let dir = std::env::temp_dir().join("custodian-demo");
    std::fs::create_dir_all(&dir)?;
    let store = Arc::new(FileVaultStore::new(dir.join("vaults.json")));
    let (service, mut events) = KeyringService::new(store);

    service.unlock("demo password", true).await?;
    let id = service
        .generate_new_keyring(KeyringType::MnemonicBip39S256, None)
        .await?;
    println!("created keyring {id}");

    let address = service.keyrings().await[0].addresses[0].clone();
    println!("first account: {address}");

    let request = TypedTransactionRequest::Eip1559(Eip1559TransactionRequest {
        chain_id: 1,
        nonce: 0,
        max_priority_fee_per_gas: 1_500_000_000,
        max_fee_per_gas: 40_000_000_000,
        gas_limit: 21_000,
        to: Address::repeat_byte(0x42),
        value: U256::from(1_000_000_000_000_000u64),
        input: Bytes::new(),
    });
    service.sign_transaction(&address, &request).await?;

    while let Ok(event) = events.try_recv() {
        match event {
            KeyringEvent::Locked(locked) => println!("event: locked = {locked}"),
            KeyringEvent::Keyrings(keyrings) => {
                println!("event: {} keyring(s)", keyrings.len())
            }
            KeyringEvent::Address(address) => println!("event: new address {address}"),
            KeyringEvent::SignedTx(tx) => println!("event: signed tx {}", tx.hash),
        }
    }

    service.lock().await;
    assert!(service.unlock("demo password", false).await?);
    println!("reconstructed {} keyring(s) after relock", service.keyrings().await.len());

    Ok(())
}
