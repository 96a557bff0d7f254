//! Per-chain wiring: the capability interface, the chain context, node
//! monitoring, and the registry of configured chains.
//!
//! Every component of a chain — RPC client, state, account manager,
//! transaction sender, listener, authentication signer — hangs off one
//! [`ChainContext`]. The [`Blockchain`] trait is the surface the rest of
//! the system talks to; [`EvmChain`] is the implementation for secp256k1
//! EVM networks. Further chain families plug in behind the same trait.

pub mod evm;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use zeroize::Zeroizing;

use crate::accounts::{AccountError, AccountManager};
use crate::auth::{AuthSigner, SignatureError};
use crate::bus::MessageBus;
use crate::config::{ChainConfig, Config, ConfigError};
use crate::jws::FlattenedJws;
use crate::listener::{BlockListener, ListenerError, extract_message};
use crate::message::{WfMessage, WfSignPayload, is_whiteflag_payload};
use crate::rpc::{INFO_INTERVAL, RpcClient, RpcError, STATUS_INTERVAL};
use crate::sender::{SendError, TransactionDisposition, TransactionSender};
use crate::state::ChainState;
use crate::store::{KeyStore, StateStore, StoreError};
use crate::util::hexstr;
use evm::EvmError;

/// Everything a chain's components share.
///
/// The context owns the chain state; components mutate it through the lock
/// and persist through [`ChainContext::persist`]. Cloning the `Arc` hands a
/// component its reference.
pub struct ChainContext {
    pub name: String,
    pub config: ChainConfig,
    pub rpc: RpcClient,
    pub state: RwLock<ChainState>,
    pub store: Arc<dyn StateStore>,
    pub keys: Arc<dyn KeyStore>,
    pub bus: MessageBus,
}

impl std::fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("name", &self.name)
            .field("rpc", &self.rpc)
            .finish()
    }
}

impl ChainContext {
    /// Persists the current state snapshot to the external store.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.state.read().await.clone();
        self.store
            .update_blockchain_data(&self.name, &snapshot)
            .await
    }
}

/// Chain operation failure, as surfaced through the capability interface.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The transaction exists but carries no Whiteflag message.
    #[error("no whiteflag message in transaction {0}")]
    NoData(String),
    /// An operation needing an account ran on a chain that has none.
    #[error("chain {0} has no accounts")]
    NoAccount(String),
    /// The submitted message does not begin with the Whiteflag marker.
    #[error("encoded message does not carry the whiteflag marker")]
    NotWhiteflag,
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Evm(#[from] EvmError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Fatal chain initialization failure. The chain is not started; other
/// chains are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum ChainInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("node verification failed: {0}")]
    Node(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// The per-chain capability interface.
#[async_trait]
pub trait Blockchain: Send + Sync {
    fn name(&self) -> &str;

    /// Submits an encoded Whiteflag message as an on-chain transaction.
    ///
    /// Sends from the given account, or the chain's first account, to the
    /// account's own address with zero value.
    async fn send_message(
        &self,
        encoded_message: &str,
        from_address: Option<&str>,
    ) -> Result<TransactionDisposition, ChainError>;

    /// Looks up a transaction by hash and decodes the Whiteflag message it
    /// carries.
    async fn lookup_message(&self, transaction_hash: &str) -> Result<WfMessage, ChainError>;

    /// Issues a detached authentication signature for an account.
    async fn request_signature(
        &self,
        payload: WfSignPayload,
    ) -> Result<FlattenedJws, ChainError>;

    /// Verifies a detached authentication signature against an address and
    /// public key.
    async fn verify_signature(
        &self,
        jws: &Value,
        address: &str,
        public_key: &str,
    ) -> Result<WfSignPayload, ChainError>;

    /// Transfers value from one of the chain's accounts to any address.
    async fn transfer_value(
        &self,
        from_address: &str,
        to_address: &str,
        value: alloy_primitives::U256,
    ) -> Result<TransactionDisposition, ChainError>;

    /// Binary form of an address, for protocol-level address encoding.
    fn binary_address(&self, address: &str) -> Result<Vec<u8>, ChainError>;

    async fn get_account(&self, address: &str) -> Result<crate::state::Account, ChainError>;

    async fn create_account(
        &self,
        secret: Option<Zeroizing<Vec<u8>>>,
    ) -> Result<crate::state::Account, ChainError>;

    async fn update_account(
        &self,
        account: &crate::state::Account,
    ) -> Result<crate::state::Account, ChainError>;

    async fn delete_account(&self, address: &str) -> Result<crate::state::Account, ChainError>;
}

/// A secp256k1 EVM chain behind the capability interface.
#[derive(Debug)]
pub struct EvmChain {
    ctx: Arc<ChainContext>,
    accounts: Arc<AccountManager>,
    sender: TransactionSender,
    auth: AuthSigner,
}

impl EvmChain {
    /// Initializes the chain: verifies the node, restores or creates the
    /// state record, provisions an account when configured, and spawns the
    /// monitors and the block listener on the given tracker.
    ///
    /// Resolves only after the node's chain id matched configuration; a
    /// mismatch aborts this chain.
    pub async fn init(
        config: ChainConfig,
        store: Arc<dyn StateStore>,
        keys: Arc<dyn KeyStore>,
        bus: MessageBus,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ChainInitError> {
        let rpc = RpcClient::new(&config)?;
        let chain_id = rpc.connect(config.chain_id).await?;

        let mut state = store.blockchain_data(&config.name).await?.unwrap_or_default();
        state.parameters.url = config.display_url()?;
        state.parameters.chain_id = chain_id;

        let ctx = Arc::new(ChainContext {
            name: config.name.clone(),
            config,
            rpc,
            state: RwLock::new(state),
            store,
            keys,
            bus,
        });
        let accounts = Arc::new(AccountManager::new(ctx.clone()));

        if ctx.config.create_account && ctx.state.read().await.accounts.is_empty() {
            accounts.create(None).await?;
        }

        // First refresh up front; the periodic tasks take over from here.
        update_node_info(&ctx).await;
        update_node_status(&ctx).await;
        ctx.persist().await?;

        let listener = BlockListener::start(ctx.clone()).await?;
        tracker.spawn(listener.run(cancel.clone()));
        tracker.spawn(run_status_monitor(ctx.clone(), cancel.clone()));
        tracker.spawn(run_info_monitor(ctx.clone(), cancel.clone()));
        {
            let accounts = accounts.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { accounts.run_refresh(cancel).await });
        }

        tracing::info!(chain = %ctx.name, chain_id, node = %ctx.rpc.display_url(), "chain initialized");
        let chain = EvmChain {
            sender: TransactionSender::new(ctx.clone(), accounts.clone()),
            auth: AuthSigner::new(ctx.clone(), accounts.clone()),
            accounts,
            ctx,
        };
        Ok(Arc::new(chain))
    }

    async fn default_account_address(&self) -> Result<String, ChainError> {
        let state = self.ctx.state.read().await;
        state
            .accounts
            .first()
            .map(|a| a.address.clone())
            .ok_or_else(|| ChainError::NoAccount(self.ctx.name.clone()))
    }
}

#[async_trait]
impl Blockchain for EvmChain {
    fn name(&self) -> &str {
        &self.ctx.name
    }

    async fn send_message(
        &self,
        encoded_message: &str,
        from_address: Option<&str>,
    ) -> Result<TransactionDisposition, ChainError> {
        let data = hexstr::decode(encoded_message).map_err(|_| ChainError::NotWhiteflag)?;
        if !is_whiteflag_payload(&data) {
            return Err(ChainError::NotWhiteflag);
        }
        let from = match from_address {
            Some(address) => hexstr::address_to_api_form(address),
            None => self.default_account_address().await?,
        };
        // Whiteflag messages are self-addressed value-less transactions.
        let disposition = self
            .sender
            .send(
                &from,
                Some(&from),
                alloy_primitives::U256::ZERO,
                data.into(),
            )
            .await?;
        Ok(disposition)
    }

    async fn lookup_message(&self, transaction_hash: &str) -> Result<WfMessage, ChainError> {
        let hash: alloy_primitives::B256 = hexstr::decode(transaction_hash)
            .ok()
            .filter(|bytes| bytes.len() == 32)
            .map(|bytes| alloy_primitives::B256::from_slice(&bytes))
            .ok_or_else(|| ChainError::NoData(transaction_hash.to_owned()))?;
        let tx = self
            .ctx
            .rpc
            .get_transaction(hash)
            .await?
            .ok_or_else(|| ChainError::NoData(transaction_hash.to_owned()))?;
        if !is_whiteflag_payload(&tx.input) {
            return Err(ChainError::NoData(transaction_hash.to_owned()));
        }
        let timestamp = match tx.block_number {
            Some(number) => self
                .ctx
                .rpc
                .get_block_by_number(number.to::<u64>())
                .await?
                .map(|block| block.timestamp.to::<u64>()),
            None => None,
        };
        Ok(extract_message(&self.ctx.name, &tx, timestamp)?)
    }

    async fn request_signature(
        &self,
        payload: WfSignPayload,
    ) -> Result<FlattenedJws, ChainError> {
        Ok(self.auth.request_signature(payload).await?)
    }

    async fn verify_signature(
        &self,
        jws: &Value,
        address: &str,
        public_key: &str,
    ) -> Result<WfSignPayload, ChainError> {
        Ok(self.auth.verify_signature(jws, address, public_key).await?)
    }

    async fn transfer_value(
        &self,
        from_address: &str,
        to_address: &str,
        value: alloy_primitives::U256,
    ) -> Result<TransactionDisposition, ChainError> {
        let from = hexstr::address_to_api_form(from_address);
        let to = hexstr::address_to_api_form(to_address);
        let disposition = self
            .sender
            .send(&from, Some(&to), value, alloy_primitives::Bytes::new())
            .await?;
        Ok(disposition)
    }

    fn binary_address(&self, address: &str) -> Result<Vec<u8>, ChainError> {
        Ok(evm::binary_address(address)?)
    }

    async fn get_account(&self, address: &str) -> Result<crate::state::Account, ChainError> {
        Ok(self.accounts.get(address).await?)
    }

    async fn create_account(
        &self,
        secret: Option<Zeroizing<Vec<u8>>>,
    ) -> Result<crate::state::Account, ChainError> {
        Ok(self.accounts.create(secret).await?)
    }

    async fn update_account(
        &self,
        account: &crate::state::Account,
    ) -> Result<crate::state::Account, ChainError> {
        Ok(self.accounts.update(account).await?)
    }

    async fn delete_account(&self, address: &str) -> Result<crate::state::Account, ChainError> {
        Ok(self.accounts.delete(address).await?)
    }
}

/// Refreshes the dynamic node status: peers, sync state, gas price, and
/// the chain head. Individual failures log and leave the previous value.
async fn update_node_status(ctx: &ChainContext) {
    let peer_count = ctx.rpc.get_peer_count().await;
    let syncing = ctx.rpc.is_syncing().await;
    let gas_price = ctx.rpc.get_gas_price().await;
    let highest = ctx.rpc.get_block_number().await;

    let mut state = ctx.state.write().await;
    match peer_count {
        Ok(peers) => state.status.peer_count = Some(peers),
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "peer count refresh failed"),
    }
    match syncing {
        Ok(sync) => {
            state.status.syncing = sync.is_syncing();
            state.status.sync_progress = sync.progress();
        }
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "sync state refresh failed"),
    }
    match gas_price {
        Ok(price) => state.status.gas_price = Some(price),
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "gas price refresh failed"),
    }
    match highest {
        Ok(block) => state.status.highest_block = block,
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "height refresh failed"),
    }
    state.status.updated = Some(chrono::Utc::now());
}

/// Refreshes the semi-static node identity facts.
async fn update_node_info(ctx: &ChainContext) {
    let network_id = ctx.rpc.get_network_id().await;
    let protocol_version = ctx.rpc.get_protocol_version().await;
    let node_info = ctx.rpc.get_node_info().await;

    let mut state = ctx.state.write().await;
    match network_id {
        Ok(id) => state.parameters.network_id = Some(id),
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "network id refresh failed"),
    }
    match protocol_version {
        Ok(version) => state.parameters.protocol_version = Some(version),
        Err(e) => {
            tracing::debug!(chain = %ctx.name, error = %e, "protocol version refresh failed")
        }
    }
    match node_info {
        Ok(info) => state.parameters.node_info = Some(info),
        Err(e) => tracing::debug!(chain = %ctx.name, error = %e, "node info refresh failed"),
    }
}

async fn run_status_monitor(ctx: Arc<ChainContext>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                update_node_status(&ctx).await;
                if let Err(e) = ctx.persist().await {
                    tracing::warn!(chain = %ctx.name, error = %e, "cannot persist node status");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn run_info_monitor(ctx: Arc<ChainContext>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(INFO_INTERVAL) => {
                update_node_info(&ctx).await;
                if let Err(e) = ctx.persist().await {
                    tracing::warn!(chain = %ctx.name, error = %e, "cannot persist node info");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Registry of running chains, keyed by chain name.
pub struct ChainRegistry {
    chains: HashMap<String, Arc<dyn Blockchain>>,
}

impl ChainRegistry {
    /// Initializes every configured chain concurrently. A chain that fails
    /// fatally is logged and left out; the others keep running.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn StateStore>,
        keys: Arc<dyn KeyStore>,
        bus: MessageBus,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let inits = config.chains().iter().map(|chain_config| {
            let store = store.clone();
            let keys = keys.clone();
            let bus = bus.clone();
            let cancel = cancel.clone();
            async move {
                let name = chain_config.name.clone();
                let result =
                    EvmChain::init(chain_config.clone(), store, keys, bus, tracker, cancel).await;
                (name, result)
            }
        });
        let mut chains: HashMap<String, Arc<dyn Blockchain>> = HashMap::new();
        for (name, result) in join_all(inits).await {
            match result {
                Ok(chain) => {
                    chains.insert(name, chain);
                }
                Err(e) => {
                    tracing::error!(chain = %name, error = %e, "chain initialization failed");
                }
            }
        }
        ChainRegistry { chains }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Blockchain>> {
        self.chains.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }
}
