//! Account lifecycle for a chain: creation, refresh, update, removal.
//!
//! Accounts live in the chain state record; their private keys live in the
//! secret store under a deterministic key id and never travel with the
//! account. A single refresh task per chain keeps balances and transaction
//! counts current.

use futures_util::future::join_all;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::chain::ChainContext;
use crate::chain::evm::{self, EvmError};
use crate::crypto;
use crate::rpc::{RpcError, STATUS_INTERVAL};
use crate::state::{self, Account};
use crate::store::{KEY_NAMESPACE, KeyStore, StoreError};

/// Account operation failure.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("no account with address {0}")]
    NoResource(String),
    #[error("account {0} already exists")]
    ResourceConflict(String),
    #[error("no private key stored for account {0}")]
    NoKey(String),
    #[error("cannot apply account update: {0}")]
    Update(serde_json::Error),
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Deterministic secret-store key: SHA-256 over chain name and address,
/// truncated to 12 bytes, 24 lowercase hex characters.
pub fn key_id(chain: &str, address: &str) -> String {
    crypto::hash(format!("{chain}{address}"), Some(12))
}

/// Manages the accounts of one chain.
#[derive(Debug)]
pub struct AccountManager {
    ctx: Arc<ChainContext>,
    /// Signalled on create/delete so the refresh timer starts a fresh
    /// interval instead of firing mid-mutation.
    rearm: Notify,
}

impl AccountManager {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        AccountManager {
            ctx,
            rearm: Notify::new(),
        }
    }

    /// Returns the account with the given address.
    pub async fn get(&self, address: &str) -> Result<Account, AccountError> {
        let state = self.ctx.state.read().await;
        state
            .account(address)
            .cloned()
            .ok_or_else(|| AccountError::NoResource(address.to_owned()))
    }

    /// Creates an account from the given secret, or from a random seed.
    ///
    /// The secret buffer is consumed and wiped when this returns, on both
    /// success and failure paths.
    pub async fn create(
        &self,
        secret: Option<Zeroizing<Vec<u8>>>,
    ) -> Result<Account, AccountError> {
        let secret = match secret {
            Some(secret) => secret,
            None => random_seed(),
        };
        let key = evm::signing_key(&secret)?;
        let public_key = evm::public_key_hex(key.verifying_key());
        let address = evm::address_from_public_key(key.verifying_key());

        {
            let mut state = self.ctx.state.write().await;
            if state.account(&address).is_some() {
                return Err(AccountError::ResourceConflict(address));
            }
            state.accounts.push(Account {
                address: address.clone(),
                public_key,
                balance: None,
                transaction_count: None,
            });
        }
        self.ctx
            .keys
            .upsert_key(KEY_NAMESPACE, &key_id(&self.ctx.name, &address), &secret)
            .await?;
        drop(secret);
        self.ctx.persist().await?;
        self.rearm.notify_one();

        tracing::info!(chain = %self.ctx.name, address = %address, "created account");
        self.get(&address).await
    }

    /// Merges the provided fields into the stored account.
    pub async fn update(&self, account: &Account) -> Result<Account, AccountError> {
        let address = account.address.clone();
        {
            let mut state = self.ctx.state.write().await;
            let stored = state
                .account_mut(&address)
                .ok_or_else(|| AccountError::NoResource(address.clone()))?;
            let mut target = serde_json::to_value(&*stored).map_err(AccountError::Update)?;
            let source = serde_json::to_value(account).map_err(AccountError::Update)?;
            state::merge(&mut target, &source);
            *stored = serde_json::from_value(target).map_err(AccountError::Update)?;
        }
        self.ctx.persist().await?;
        self.get(&address).await
    }

    /// Removes the account and its stored private key.
    pub async fn delete(&self, address: &str) -> Result<Account, AccountError> {
        let removed = {
            let mut state = self.ctx.state.write().await;
            state
                .remove_account(address)
                .ok_or_else(|| AccountError::NoResource(address.to_owned()))?
        };
        self.ctx
            .keys
            .delete_key(KEY_NAMESPACE, &key_id(&self.ctx.name, &removed.address))
            .await?;
        self.ctx.persist().await?;
        self.rearm.notify_one();

        tracing::info!(chain = %self.ctx.name, address = %removed.address, "deleted account");
        Ok(removed)
    }

    /// Derives the address belonging to a public key.
    pub fn address_from_public_key(&self, public_key: &str) -> Result<String, AccountError> {
        let key = evm::verifying_key(public_key)?;
        Ok(evm::address_from_public_key(&key))
    }

    /// Returns the stored public key of an account.
    pub async fn public_key_from_address(&self, address: &str) -> Result<String, AccountError> {
        Ok(self.get(address).await?.public_key)
    }

    /// Fetches the account's private key from the secret store.
    ///
    /// Signing paths call this; the buffer wipes itself on drop.
    pub async fn private_key(&self, address: &str) -> Result<Zeroizing<Vec<u8>>, AccountError> {
        self.ctx
            .keys
            .key(KEY_NAMESPACE, &key_id(&self.ctx.name, address))
            .await?
            .ok_or_else(|| AccountError::NoKey(address.to_owned()))
    }

    /// Periodic refresh loop. One instance runs per chain; create/delete
    /// re-arm the timer so the next run is a full interval away.
    pub async fn run_refresh(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STATUS_INTERVAL) => {
                    self.update_accounts().await;
                }
                _ = self.rearm.notified() => {
                    // Timer restarted, nothing to do this round.
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Refreshes balance and transaction count of every account. Failures
    /// are logged per account and do not fail the batch.
    pub async fn update_accounts(&self) {
        let addresses: Vec<String> = {
            let state = self.ctx.state.read().await;
            state.accounts.iter().map(|a| a.address.clone()).collect()
        };
        if addresses.is_empty() {
            return;
        }
        let refreshes = addresses.iter().map(|address| async move {
            let parsed = evm::parse_address(address)?;
            let balance = self.ctx.rpc.get_balance(parsed).await?;
            let transaction_count = self.ctx.rpc.get_transaction_count(parsed).await?;
            Ok::<_, AccountError>((balance, transaction_count))
        });
        let results = join_all(refreshes).await;

        let mut changed = false;
        {
            let mut state = self.ctx.state.write().await;
            for (address, result) in addresses.iter().zip(results) {
                match result {
                    Ok((balance, transaction_count)) => {
                        let Some(account) = state.account_mut(address) else {
                            continue;
                        };
                        if let Some(previous) = account.balance {
                            if balance > previous {
                                tracing::info!(
                                    chain = %self.ctx.name,
                                    address = %address,
                                    delta = %format!("+{}", balance - previous),
                                    "account balance changed"
                                );
                            } else if balance < previous {
                                tracing::info!(
                                    chain = %self.ctx.name,
                                    address = %address,
                                    delta = %format!("-{}", previous - balance),
                                    "account balance changed"
                                );
                            }
                        }
                        account.balance = Some(balance);
                        account.transaction_count = Some(transaction_count);
                        changed = true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            chain = %self.ctx.name,
                            address = %address,
                            error = %e,
                            "account refresh failed"
                        );
                    }
                }
            }
        }
        if changed {
            if let Err(e) = self.ctx.persist().await {
                tracing::warn!(chain = %self.ctx.name, error = %e, "cannot persist account refresh");
            }
        }
    }
}

/// A fresh random 32-byte seed, resampled in the negligible case the
/// scalar falls outside the curve order.
fn random_seed() -> Zeroizing<Vec<u8>> {
    loop {
        let mut seed = Zeroizing::new(vec![0u8; 32]);
        rand::rng().fill_bytes(&mut seed);
        if evm::signing_key(&seed).is_ok() {
            return seed;
        }
    }
}
