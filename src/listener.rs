//! Block listener: ordered block advancement and Whiteflag message
//! extraction.
//!
//! One listener runs per chain as a single cooperative task that advances a
//! monotonically non-decreasing block cursor. Each iteration fetches the
//! chain height, walks the blocks behind it in order, fans a block's
//! transactions out in bounded concurrent batches, filters for the
//! Whiteflag marker, and emits decoded messages on the receive bus.
//!
//! Messages are emitted in `(block, transaction index)` order. A block is
//! only marked processed — and the cursor persisted — after all of its
//! messages are out. A failing block is retried in place; with a retry
//! budget configured, an exhausted block is skipped so the pipeline never
//! stalls indefinitely.

use alloy_primitives::B256;
use chrono::SecondsFormat;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainContext;
use crate::chain::evm;
use crate::message::{MetaHeader, WfMessage, is_whiteflag_payload};
use crate::rpc::{RpcError, RpcTransaction};
use crate::store::StoreError;

/// Consecutive blocks processed per iteration.
pub const BLOCK_STACK_SIZE: u64 = 100;
/// Pause before retrying a failed block.
pub const BLOCK_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Listener failure.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("cannot determine starting block: no configured start, no stored cursor, no height")]
    NoStartingBlock,
    #[error("block {0} not available")]
    MissingBlock(u64),
    #[error("transaction {0} not available")]
    MissingTransaction(B256),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Derives the cursor to resume from: the last block considered processed.
///
/// In order: an explicitly configured start wins (minus one, so the
/// configured block itself is processed next); a cursor far behind the
/// chain head rewinds to `highest - rewind`; a stored cursor resumes
/// as-is; otherwise processing starts at the head.
pub fn starting_block(
    highest: u64,
    current: u64,
    configured_start: u64,
    rewind: u64,
) -> Result<u64, ListenerError> {
    if configured_start > 0 {
        Ok(configured_start - 1)
    } else if highest.saturating_sub(rewind) > current + 1 {
        Ok(highest - rewind - 1)
    } else if current > 0 {
        Ok(current)
    } else if highest > 0 {
        Ok(highest - 1)
    } else {
        Err(ListenerError::NoStartingBlock)
    }
}

/// Outcome of the height fetch at the top of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeightDecision {
    /// Configured end reached; the listener is done.
    Stop,
    /// Nothing new, or the node is resyncing below the cursor.
    Idle,
    /// Process blocks `cursor+1 ..= end`.
    Process { end: u64 },
}

fn height_decision(cursor: u64, highest: u64, configured_end: u64) -> HeightDecision {
    if configured_end > 0 && cursor >= configured_end {
        return HeightDecision::Stop;
    }
    if highest == cursor || cursor > highest {
        return HeightDecision::Idle;
    }
    let end = if configured_end > 0 {
        highest.min(configured_end)
    } else {
        highest
    };
    HeightDecision::Process { end }
}

/// Whether a failed block is retried in place or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retry,
    Skip,
}

fn retry_decision(retries: u32, max_retries: u32) -> RetryDecision {
    if max_retries > 0 && retries > max_retries {
        RetryDecision::Skip
    } else {
        RetryDecision::Retry
    }
}

/// Iteration states of the listener loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterationState {
    Scheduled,
    FetchingHeight,
    ProcessingBlock { end: u64 },
    WaitingRetry { end: u64 },
    Stopped,
}

/// Per-chain block listener.
#[derive(Debug)]
pub struct BlockListener {
    ctx: Arc<ChainContext>,
    /// Last block considered processed.
    cursor: u64,
    /// Consecutive failures of the block at `cursor + 1`.
    retries: u32,
    state: IterationState,
}

impl BlockListener {
    /// Creates the listener, deriving its cursor from configuration and
    /// persisted state.
    pub async fn start(ctx: Arc<ChainContext>) -> Result<Self, ListenerError> {
        let highest = ctx.rpc.get_block_number().await?;
        let current = ctx.state.read().await.status.current_block;
        let cursor = starting_block(
            highest,
            current,
            ctx.config.block_retrieval_start,
            ctx.config.block_retrieval_restart,
        )?;
        {
            let mut state = ctx.state.write().await;
            state.status.highest_block = highest;
            state.status.current_block = cursor;
        }
        ctx.persist().await?;
        tracing::info!(
            chain = %ctx.name,
            cursor,
            highest,
            "block listener starting"
        );
        Ok(BlockListener {
            ctx,
            cursor,
            retries: 0,
            state: IterationState::Scheduled,
        })
    }

    /// Runs the iteration loop until stopped or cancelled. Cancellation
    /// leaves the cursor as persisted, so a successor resumes cleanly.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            match self.state {
                IterationState::Scheduled => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.retrieval_interval()) => {
                            self.state = IterationState::FetchingHeight;
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                IterationState::FetchingHeight => {
                    self.state = self.fetch_height().await;
                }
                IterationState::ProcessingBlock { end } => {
                    self.state = self.process_blocks(end, &cancel).await;
                }
                IterationState::WaitingRetry { end } => {
                    tokio::select! {
                        _ = tokio::time::sleep(BLOCK_RETRY_DELAY) => {
                            self.state = IterationState::ProcessingBlock { end };
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
                IterationState::Stopped => {
                    tracing::info!(chain = %self.ctx.name, cursor = self.cursor, "block listener stopped");
                    break;
                }
            }
            if cancel.is_cancelled() {
                break;
            }
        }
    }

    async fn fetch_height(&mut self) -> IterationState {
        let highest = match self.ctx.rpc.get_block_number().await {
            Ok(highest) => highest,
            Err(e) => {
                tracing::warn!(chain = %self.ctx.name, error = %e, "cannot fetch chain height");
                return IterationState::Scheduled;
            }
        };
        {
            let mut state = self.ctx.state.write().await;
            state.status.highest_block = highest;
        }
        match height_decision(self.cursor, highest, self.ctx.config.block_retrieval_end) {
            HeightDecision::Stop => IterationState::Stopped,
            HeightDecision::Idle => {
                if self.cursor > highest {
                    tracing::warn!(
                        chain = %self.ctx.name,
                        cursor = self.cursor,
                        highest,
                        "node reports height below cursor, assuming resync"
                    );
                }
                IterationState::Scheduled
            }
            HeightDecision::Process { end } => IterationState::ProcessingBlock { end },
        }
    }

    /// Advances through blocks `cursor+1 ..= end`, bounded per iteration.
    async fn process_blocks(&mut self, end: u64, cancel: &CancellationToken) -> IterationState {
        let span_end = end.min(self.cursor + BLOCK_STACK_SIZE);
        while self.cursor < span_end {
            if cancel.is_cancelled() {
                return IterationState::Stopped;
            }
            let number = self.cursor + 1;
            match self.process_block(number).await {
                Ok(messages) => {
                    if messages > 0 {
                        tracing::info!(
                            chain = %self.ctx.name,
                            block = number,
                            messages,
                            "processed block"
                        );
                    }
                    self.retries = 0;
                    self.advance_cursor(number).await;
                }
                Err(e) => {
                    self.retries += 1;
                    match retry_decision(self.retries, self.ctx.config.block_max_retries) {
                        RetryDecision::Retry => {
                            tracing::warn!(
                                chain = %self.ctx.name,
                                block = number,
                                retries = self.retries,
                                error = %e,
                                "block processing failed, will retry"
                            );
                            return IterationState::WaitingRetry { end };
                        }
                        RetryDecision::Skip => {
                            tracing::warn!(
                                chain = %self.ctx.name,
                                block = number,
                                retries = self.retries,
                                error = %e,
                                "retries exhausted, skipping block"
                            );
                            self.retries = 0;
                            self.advance_cursor(number).await;
                        }
                    }
                }
            }
        }
        IterationState::Scheduled
    }

    async fn advance_cursor(&mut self, number: u64) {
        self.cursor = number;
        {
            let mut state = self.ctx.state.write().await;
            state.status.current_block = number;
        }
        if let Err(e) = self.ctx.persist().await {
            tracing::warn!(chain = %self.ctx.name, error = %e, "cannot persist block cursor");
        }
    }

    /// Processes a single block: fetch, batch its transactions, emit every
    /// Whiteflag message in transaction-index order. Returns the number of
    /// messages emitted. Any failure leaves the block unprocessed.
    async fn process_block(&self, number: u64) -> Result<usize, ListenerError> {
        let block = self
            .ctx
            .rpc
            .get_block_by_number(number)
            .await?
            .ok_or(ListenerError::MissingBlock(number))?;
        if block.transactions.is_empty() {
            return Ok(0);
        }
        let timestamp = block.timestamp.to::<u64>();
        let mut emitted = 0;
        for batch in block.transactions.chunks(self.ctx.config.transaction_batch_size) {
            // The whole batch settles before the next one starts; results
            // come back in index order so emission order is preserved.
            let results = join_all(
                batch
                    .iter()
                    .map(|hash| self.process_transaction(*hash, timestamp)),
            )
            .await;
            for result in results {
                if let Some(message) = result? {
                    self.ctx.bus.emit_message_received(message);
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }

    /// Fetches one transaction and decodes it if it carries the Whiteflag
    /// marker. Returns `None` for foreign traffic.
    async fn process_transaction(
        &self,
        hash: B256,
        timestamp: u64,
    ) -> Result<Option<WfMessage>, ListenerError> {
        let tx = self
            .ctx
            .rpc
            .get_transaction(hash)
            .await?
            .ok_or(ListenerError::MissingTransaction(hash))?;
        if self.ctx.config.trace_raw_transaction {
            tracing::trace!(chain = %self.ctx.name, transaction = ?tx, "raw transaction");
        }
        if !is_whiteflag_payload(&tx.input) {
            return Ok(None);
        }
        match extract_message(&self.ctx.name, &tx, Some(timestamp)) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                // The marker matched but the originator cannot be
                // attributed; dropping it here keeps the block from being
                // retried forever over one undecodable transaction.
                tracing::warn!(
                    chain = %self.ctx.name,
                    transaction = %hex::encode(hash),
                    error = %e,
                    "cannot decode whiteflag transaction, discarding"
                );
                Ok(None)
            }
        }
    }
}

/// Builds a [`WfMessage`] from a Whiteflag-bearing transaction and its
/// block timestamp. All metadata fields are canonical API form.
pub fn extract_message(
    chain: &str,
    tx: &RpcTransaction,
    timestamp: Option<u64>,
) -> Result<WfMessage, evm::EvmError> {
    let key = evm::recover_sender_public_key(tx)?;
    let transaction_time = timestamp
        .and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
    Ok(WfMessage::from_meta_header(MetaHeader {
        blockchain: chain.to_owned(),
        block_number: tx.block_number.map(|n| n.to::<u64>()).unwrap_or_default(),
        transaction_hash: hex::encode(tx.hash),
        transaction_time,
        originator_address: hex::encode(tx.from),
        originator_pub_key: evm::public_key_hex(&key),
        encoded_message: hex::encode(&tx.input),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, U64, U256, keccak256};

    #[test]
    fn starting_block_prefers_configured_start() {
        // The configured block itself is the next one processed.
        assert_eq!(starting_block(1000, 500, 200, 100).unwrap(), 199);
        assert_eq!(starting_block(0, 0, 1, 100).unwrap(), 0);
    }

    #[test]
    fn starting_block_rewinds_when_far_behind() {
        // Far behind the head: resume `rewind` blocks back from it.
        assert_eq!(starting_block(1000, 500, 0, 100).unwrap(), 899);
    }

    #[test]
    fn starting_block_resumes_stored_cursor() {
        assert_eq!(starting_block(1000, 950, 0, 100).unwrap(), 950);
    }

    #[test]
    fn starting_block_falls_back_to_head() {
        assert_eq!(starting_block(1000, 0, 0, 2000).unwrap(), 999);
    }

    #[test]
    fn starting_block_fails_without_any_reference() {
        assert!(matches!(
            starting_block(0, 0, 0, 100),
            Err(ListenerError::NoStartingBlock)
        ));
    }

    #[test]
    fn height_decision_idles_when_caught_up_or_resyncing() {
        assert_eq!(height_decision(1000, 1000, 0), HeightDecision::Idle);
        assert_eq!(height_decision(1000, 900, 0), HeightDecision::Idle);
    }

    #[test]
    fn height_decision_bounds_end_by_configuration() {
        assert_eq!(
            height_decision(10, 1000, 0),
            HeightDecision::Process { end: 1000 }
        );
        assert_eq!(
            height_decision(10, 1000, 50),
            HeightDecision::Process { end: 50 }
        );
        assert_eq!(
            height_decision(10, 30, 50),
            HeightDecision::Process { end: 30 }
        );
    }

    #[test]
    fn height_decision_stops_past_configured_end() {
        assert_eq!(height_decision(50, 1000, 50), HeightDecision::Stop);
        assert_eq!(height_decision(51, 1000, 50), HeightDecision::Stop);
        assert_eq!(height_decision(50, 1000, 0), HeightDecision::Process { end: 1000 });
    }

    #[test]
    fn unbounded_retries_never_skip() {
        assert_eq!(retry_decision(1000, 0), RetryDecision::Retry);
    }

    #[test]
    fn block_skips_after_budget_exhausted() {
        // With a budget of 3, the block is retried on failures one through
        // three and skipped after the fourth attempt fails.
        assert_eq!(retry_decision(1, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(2, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(3, 3), RetryDecision::Retry);
        assert_eq!(retry_decision(4, 3), RetryDecision::Skip);
    }

    fn whiteflag_transaction() -> RpcTransaction {
        // Sign a Whiteflag-bearing transaction, then present it the way the
        // node would return it.
        let secret = [0x46u8; 32];
        let data = Bytes::from(hex::decode("57460a0000").unwrap());
        let unsigned = evm::UnsignedTransaction {
            nonce: 3,
            gas_price: 1_000_000_000,
            gas_limit: 30_000,
            to: Some(evm::parse_address("9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f").unwrap()),
            value: U256::ZERO,
            data: data.clone(),
        };
        let signed = evm::sign_transaction(&unsigned, 1, &secret).unwrap();
        // Decode the raw transaction's signature members.
        let decoded: alloy_consensus::TxEnvelope =
            alloy_eips::eip2718::Decodable2718::decode_2718(&mut signed.raw.as_ref()).unwrap();
        let alloy_consensus::TxEnvelope::Legacy(signed_legacy) = decoded else {
            panic!("expected legacy envelope");
        };
        let signature = signed_legacy.signature();
        let v = 35 + 2 * 1 + u64::from(signature.v());
        RpcTransaction {
            hash: signed.hash,
            nonce: U64::from(3),
            block_hash: Some(keccak256(b"block")),
            block_number: Some(U64::from(1024)),
            transaction_index: Some(U64::from(0)),
            from: evm::parse_address("9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f").unwrap(),
            to: unsigned.to,
            value: U256::ZERO,
            gas_price: Some(alloy_primitives::U128::from(1_000_000_000u64)),
            gas: U64::from(30_000),
            input: data,
            transaction_type: None,
            v: Some(U64::from(v)),
            r: Some(signature.r()),
            s: Some(signature.s()),
        }
    }

    #[test]
    fn extract_message_builds_canonical_metadata() {
        let tx = whiteflag_transaction();
        let message = extract_message("testchain", &tx, Some(1_690_000_000)).unwrap();
        let meta = &message.meta_header;
        assert_eq!(meta.blockchain, "testchain");
        assert_eq!(meta.block_number, 1024);
        assert_eq!(meta.transaction_hash.len(), 64);
        assert!(meta.encoded_message.starts_with("5746"));
        assert_eq!(
            meta.originator_address,
            "9d8a62f656a8d1615c1294fd71e9cfb3e4855a4f"
        );
        // SEC uncompressed originator key that actually signed the payload.
        assert_eq!(meta.originator_pub_key.len(), 130);
        assert!(meta.originator_pub_key.starts_with("04"));
        assert_eq!(
            evm::address_from_public_key(&evm::verifying_key(&meta.originator_pub_key).unwrap()),
            meta.originator_address
        );
        assert_eq!(
            meta.transaction_time.as_deref(),
            Some("2023-07-22T04:26:40.000Z")
        );
        // Every hex field is canonical: lowercase, no prefix.
        for field in [
            &meta.transaction_hash,
            &meta.originator_address,
            &meta.originator_pub_key,
            &meta.encoded_message,
        ] {
            assert!(field.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(!field.contains("0x"));
            assert_eq!(field.to_lowercase(), **field);
        }
    }

    #[test]
    fn whiteflag_filter_discards_foreign_payloads() {
        assert!(is_whiteflag_payload(&hex::decode("5746010000").unwrap()));
        assert!(!is_whiteflag_payload(&hex::decode("deadbeef").unwrap()));
    }
}
