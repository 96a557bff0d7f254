//! EVM key, address, and transaction primitives.
//!
//! Whiteflag accounts on EVM chains are plain secp256k1 keypairs. Addresses
//! derive from the keccak-256 of the uncompressed public point; raw
//! transactions are EIP-155 legacy transactions, which keeps the sender
//! public key recoverable from the on-wire `r`/`s`/`v` fields.

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, B256, Bytes, Signature, TxKind, U256, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use k256::ecdsa::{SigningKey, VerifyingKey};

use crate::rpc::RpcTransaction;
use crate::util::hexstr;

/// EVM key or transaction handling failure.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    #[error("invalid secp256k1 secret key")]
    InvalidSecretKey,
    #[error("invalid secp256k1 public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("cannot recover sender from transaction type {0}")]
    UnsupportedTransactionType(u64),
    #[error("transaction carries no usable signature")]
    IncompleteSignature,
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] alloy_primitives::SignatureError),
    #[error(transparent)]
    Signer(#[from] alloy_signer::Error),
}

/// Parses a secret scalar into a signing key. The caller keeps ownership of
/// the input buffer and is responsible for wiping it.
pub fn signing_key(secret: &[u8]) -> Result<SigningKey, EvmError> {
    SigningKey::from_slice(secret).map_err(|_| EvmError::InvalidSecretKey)
}

/// SEC uncompressed public key as 130 lowercase hex characters.
pub fn public_key_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(false).as_bytes())
}

/// Parses an API-form or `0x`-prefixed public key into a verifying key.
pub fn verifying_key(public_key: &str) -> Result<VerifyingKey, EvmError> {
    let normalized = hexstr::public_key_to_api_form(public_key)
        .map_err(|e| EvmError::InvalidPublicKey(e.to_string()))?;
    let bytes =
        hex::decode(&normalized).map_err(|e| EvmError::InvalidPublicKey(e.to_string()))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| EvmError::InvalidPublicKey("not a point on secp256k1".to_owned()))
}

/// Derives the account address from a public key, API form: 40 lowercase
/// hex characters, no prefix.
pub fn address_from_public_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    hex::encode(&digest[12..])
}

/// Parses an API-form or `0x`-prefixed address.
pub fn parse_address(address: &str) -> Result<Address, EvmError> {
    let bytes = hexstr::decode(address).map_err(|e| EvmError::InvalidAddress(e.to_string()))?;
    if bytes.len() != Address::len_bytes() {
        return Err(EvmError::InvalidAddress(format!(
            "expected 20 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(&bytes))
}

/// Binary form of an API address, for protocol-level address encoding.
pub fn binary_address(address: &str) -> Result<Vec<u8>, EvmError> {
    Ok(parse_address(address)?.to_vec())
}

/// An assembled but unsigned legacy transaction.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// A signed raw transaction ready for submission.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    /// EIP-2718 encoding, the `eth_sendRawTransaction` argument.
    pub raw: Bytes,
    pub hash: B256,
}

/// Signs a legacy transaction under EIP-155 replay protection.
///
/// The secret buffer is only read; the caller wipes it after this returns.
pub fn sign_transaction(
    tx: &UnsignedTransaction,
    chain_id: u64,
    secret: &[u8],
) -> Result<SignedTransaction, EvmError> {
    let legacy = TxLegacy {
        chain_id: Some(chain_id),
        nonce: tx.nonce,
        gas_price: tx.gas_price,
        gas_limit: tx.gas_limit,
        to: tx.to.map(TxKind::Call).unwrap_or(TxKind::Create),
        value: tx.value,
        input: tx.data.clone(),
    };
    let signer =
        PrivateKeySigner::from_slice(secret).map_err(|_| EvmError::InvalidSecretKey)?;
    let signature = signer.sign_hash_sync(&legacy.signature_hash())?;
    let signed = legacy.into_signed(signature);
    let hash = *signed.hash();
    let raw = TxEnvelope::Legacy(signed).encoded_2718();
    Ok(SignedTransaction {
        raw: Bytes::from(raw),
        hash,
    })
}

/// Recovers the sender public key of an observed legacy transaction.
///
/// The signing payload is reconstructed with the chain id taken from the
/// EIP-155 `v` value; pre-EIP-155 signatures (`v` of 27/28) are handled
/// without one. Typed transactions are not candidate Whiteflag carriers and
/// are rejected.
pub fn recover_sender_public_key(tx: &RpcTransaction) -> Result<VerifyingKey, EvmError> {
    let tx_type = tx.transaction_type.map(|t| t.to::<u64>()).unwrap_or(0);
    if tx_type != 0 {
        return Err(EvmError::UnsupportedTransactionType(tx_type));
    }
    let (v, r, s) = match (tx.v, tx.r, tx.s) {
        (Some(v), Some(r), Some(s)) => (v.to::<u64>(), r, s),
        _ => return Err(EvmError::IncompleteSignature),
    };
    let (chain_id, y_parity) = if v >= 35 {
        (Some((v - 35) / 2), (v - 35) % 2 == 1)
    } else {
        (None, v == 28)
    };
    let legacy = TxLegacy {
        chain_id,
        nonce: tx.nonce.to::<u64>(),
        gas_price: tx.gas_price.map(|p| p.to::<u128>()).unwrap_or_default(),
        gas_limit: tx.gas.to::<u64>(),
        to: tx.to.map(TxKind::Call).unwrap_or(TxKind::Create),
        value: tx.value,
        input: tx.input.clone(),
    };
    let signature = Signature::new(r, s, y_parity);
    let key = signature.recover_from_prehash(&legacy.signature_hash())?;
    Ok(key)
}
