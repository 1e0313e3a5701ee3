//! Transaction request and signed-transaction record shapes.
//!
//! The custody core only inspects the fields it must: a request has to
//! carry both EIP-1559 fee components before it may be signed, and raw
//! signed bytes are decoded back into a structured record that the rest
//! of the system consumes via the event stream.

use alloy::consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, Bytes, TxKind, U256};
use serde::{Deserialize, Serialize};

use crate::error::{KeyringError, Result};

/// Asset symbol attached to every emitted signed transaction.
pub const BASE_ASSET: &str = "ETH";

/// An unsigned transaction request, discriminated by fee scheme.
///
/// Only the EIP-1559 shape is signable; the legacy shape exists so the
/// orchestrator can reject it explicitly rather than by parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TypedTransactionRequest {
    Eip1559(Eip1559TransactionRequest),
    Legacy(LegacyTransactionRequest),
}

/// EIP-1559 request: separate priority-fee and max-fee components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eip1559TransactionRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: u128,
    pub max_fee_per_gas: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

/// Single flat gas price; kept only to be rejected with
/// `UnsupportedTransactionType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTransactionRequest {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: U256,
    pub input: Bytes,
}

impl Eip1559TransactionRequest {
    pub(crate) fn to_unsigned(&self) -> TxEip1559 {
        TxEip1559 {
            chain_id: self.chain_id,
            nonce: self.nonce,
            gas_limit: self.gas_limit,
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            to: TxKind::Call(self.to),
            value: self.value,
            access_list: Default::default(),
            input: self.input.clone(),
        }
    }
}

/// The structured record emitted after signing. Block-inclusion fields
/// stay `None` until the transaction is mined, which is outside this
/// core's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEvmTransaction {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub nonce: u64,
    pub input: Bytes,
    pub value: U256,
    pub tx_type: u8,
    pub gas_price: Option<u128>,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_limit: u64,
    pub r: U256,
    pub s: U256,
    pub v: u64,
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub chain_id: u64,
    pub asset: String,
}

pub(crate) fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Decode raw signed bytes back into a structured record, verifying the
/// signature actually completed: an EIP-1559 envelope, a present
/// recipient, and a recoverable sender.
pub fn parse_signed_transaction(raw: &[u8]) -> Result<SignedEvmTransaction> {
    let envelope = TxEnvelope::decode_2718(&mut &raw[..])
        .map_err(|e| KeyringError::SigningIncomplete(format!("undecodable envelope: {e}")))?;

    let signed = match envelope {
        TxEnvelope::Eip1559(signed) => signed,
        _ => {
            return Err(KeyringError::SigningIncomplete(
                "signed bytes are not an EIP-1559 envelope".into(),
            ))
        }
    };

    let tx = signed.tx();
    let signature = signed.signature();

    let to = match tx.to {
        TxKind::Call(address) => address,
        TxKind::Create => {
            return Err(KeyringError::SigningIncomplete(
                "signed transaction has no recipient".into(),
            ))
        }
    };

    let from = signature
        .recover_address_from_prehash(&tx.signature_hash())
        .map_err(|e| KeyringError::SigningIncomplete(format!("unrecoverable sender: {e}")))?;

    Ok(SignedEvmTransaction {
        hash: format!("0x{}", hex::encode(signed.hash())),
        from: format_address(&from),
        to: format_address(&to),
        nonce: tx.nonce,
        input: tx.input.clone(),
        value: tx.value,
        tx_type: 2,
        gas_price: None,
        max_fee_per_gas: tx.max_fee_per_gas,
        max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
        gas_limit: tx.gas_limit,
        r: signature.r(),
        s: signature.s(),
        v: u64::from(signature.v()),
        block_hash: None,
        block_height: None,
        chain_id: tx.chain_id,
        asset: BASE_ASSET.to_string(),
    })
}
