//! Outbound transaction pipeline: build, sign, submit, resolve.
//!
//! A send walks a single deterministic state machine. Submission either
//! yields a node-accepted hash, degrades to receipt polling when the
//! outcome is indeterminate (the locally computed hash is still valid), or
//! fails outright on a definitive rejection. Receipt polling runs a bounded
//! retry budget; exhausting it resolves the send as partial, with the hash
//! but no block number.

use alloy_primitives::{B256, Bytes, U256};
use std::sync::Arc;
use std::time::Duration;

use crate::accounts::{AccountError, AccountManager};
use crate::chain::ChainContext;
use crate::chain::evm::{self, EvmError, UnsignedTransaction};
use crate::rpc::RpcError;

/// Receipt polls before a send resolves as partial.
pub const MAX_RETRIES: u32 = 8;
/// Spacing between receipt polls.
const RECEIPT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Send failure.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The transaction was definitively not accepted by the node.
    #[error("transaction submission failed: {0}")]
    SendFailed(RpcError),
    /// Failure while assembling the transaction, before anything was sent.
    #[error("cannot build transaction: {0}")]
    Build(RpcError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Evm(#[from] EvmError),
}

/// Final disposition of a successful send.
///
/// `block_number` is absent when the receipt retry budget ran out: the
/// transaction is on the wire with a known hash, but inclusion was not
/// observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDisposition {
    /// Transaction hash, canonical API form.
    pub transaction_hash: String,
    pub block_number: Option<u64>,
}

/// Outcome of one submission attempt.
#[derive(Debug)]
enum SubmitOutcome {
    /// Node accepted and returned the hash.
    Accepted(B256),
    /// Indeterminate: the call timed out or the transport failed after the
    /// transaction may have reached the node. Poll with the local hash.
    Indeterminate(B256),
    /// Definitive rejection.
    Rejected(RpcError),
}

fn classify_submission(local_hash: B256, result: Result<B256, RpcError>) -> SubmitOutcome {
    match result {
        Ok(hash) => SubmitOutcome::Accepted(hash),
        Err(e) if e.is_transient() => SubmitOutcome::Indeterminate(local_hash),
        Err(e) => SubmitOutcome::Rejected(e),
    }
}

/// Outcome of one receipt poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiptOutcome {
    /// Receipt observed with the including block.
    Found(u64),
    /// No receipt yet, or the poll failed; both consume one retry.
    Pending,
}

/// One step of the receipt arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiptStep {
    Retry(u32),
    Done(u64),
    /// Retry budget exhausted: resolve with the hash only.
    Partial,
}

fn receipt_transition(retries: u32, outcome: ReceiptOutcome) -> ReceiptStep {
    match outcome {
        ReceiptOutcome::Found(block) => ReceiptStep::Done(block),
        ReceiptOutcome::Pending if retries + 1 >= MAX_RETRIES => ReceiptStep::Partial,
        ReceiptOutcome::Pending => ReceiptStep::Retry(retries + 1),
    }
}

/// Builds, signs, and submits transactions for one chain.
#[derive(Debug)]
pub struct TransactionSender {
    ctx: Arc<ChainContext>,
    accounts: Arc<AccountManager>,
}

impl TransactionSender {
    pub fn new(ctx: Arc<ChainContext>, accounts: Arc<AccountManager>) -> Self {
        TransactionSender { ctx, accounts }
    }

    /// Sends `value` and `data` from the given account.
    ///
    /// Resolves on receipt, on confirmation of inclusion, or after the
    /// retry budget with a partial disposition. The account's private key
    /// is fetched for the signature only and wiped immediately after.
    pub async fn send(
        &self,
        from_address: &str,
        to_address: Option<&str>,
        value: U256,
        data: Bytes,
    ) -> Result<TransactionDisposition, SendError> {
        let account = self.accounts.get(from_address).await?;
        let from = evm::parse_address(&account.address)?;
        let to = to_address.map(evm::parse_address).transpose()?;

        let nonce = self
            .ctx
            .rpc
            .get_transaction_count(from)
            .await
            .map_err(SendError::Build)?;
        let gas_limit = self
            .ctx
            .rpc
            .estimate_gas(from, to, &data)
            .await
            .map_err(SendError::Build)?;
        let gas_price = self.ctx.rpc.get_gas_price().await.map_err(SendError::Build)?;

        let unsigned = UnsignedTransaction {
            nonce,
            gas_price,
            gas_limit,
            to,
            value,
            data,
        };
        let secret = self.accounts.private_key(&account.address).await?;
        let signed = evm::sign_transaction(&unsigned, self.ctx.config.chain_id, &secret);
        drop(secret);
        let signed = signed?;

        tracing::debug!(
            chain = %self.ctx.name,
            from = %account.address,
            nonce,
            gas_limit,
            "submitting transaction"
        );
        let submission = self.ctx.rpc.send_signed_transaction(&signed.raw).await;
        match classify_submission(signed.hash, submission) {
            SubmitOutcome::Accepted(hash) => self.await_receipt(hash).await,
            SubmitOutcome::Indeterminate(hash) => {
                tracing::warn!(
                    chain = %self.ctx.name,
                    transaction = %hex::encode(hash),
                    "submission outcome unknown, awaiting receipt"
                );
                self.await_receipt(hash).await
            }
            SubmitOutcome::Rejected(e) => Err(SendError::SendFailed(e)),
        }
    }

    /// Polls for the receipt until found or the retry budget runs out.
    /// Resolves exactly once.
    async fn await_receipt(&self, hash: B256) -> Result<TransactionDisposition, SendError> {
        let transaction_hash = hex::encode(hash);
        let mut retries = 0;
        loop {
            let outcome = match self.ctx.rpc.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => match receipt.block_number {
                    Some(block) => ReceiptOutcome::Found(block.to::<u64>()),
                    None => ReceiptOutcome::Pending,
                },
                Ok(None) => ReceiptOutcome::Pending,
                Err(e) => {
                    tracing::debug!(
                        chain = %self.ctx.name,
                        transaction = %transaction_hash,
                        error = %e,
                        "receipt poll failed"
                    );
                    ReceiptOutcome::Pending
                }
            };
            match receipt_transition(retries, outcome) {
                ReceiptStep::Done(block) => {
                    tracing::info!(
                        chain = %self.ctx.name,
                        transaction = %transaction_hash,
                        block,
                        "transaction included"
                    );
                    return Ok(TransactionDisposition {
                        transaction_hash,
                        block_number: Some(block),
                    });
                }
                ReceiptStep::Partial => {
                    tracing::warn!(
                        chain = %self.ctx.name,
                        transaction = %transaction_hash,
                        "no receipt after {MAX_RETRIES} polls, resolving without block"
                    );
                    return Ok(TransactionDisposition {
                        transaction_hash,
                        block_number: None,
                    });
                }
                ReceiptStep::Retry(next) => {
                    retries = next;
                    tokio::time::sleep(RECEIPT_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> B256 {
        B256::repeat_byte(0xab)
    }

    #[test]
    fn accepted_submission_keeps_node_hash() {
        let node_hash = B256::repeat_byte(0xcd);
        match classify_submission(hash(), Ok(node_hash)) {
            SubmitOutcome::Accepted(h) => assert_eq!(h, node_hash),
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[test]
    fn timeout_degrades_to_receipt_polling_with_local_hash() {
        let result = Err(RpcError::Timeout {
            method: "eth_sendRawTransaction",
            timeout: Duration::from_secs(50),
        });
        match classify_submission(hash(), result) {
            SubmitOutcome::Indeterminate(h) => assert_eq!(h, hash()),
            other => panic!("expected indeterminate, got {other:?}"),
        }
    }

    #[test]
    fn node_rejection_fails_the_send() {
        let result = Err(RpcError::Node {
            method: "eth_sendRawTransaction",
            code: -32000,
            message: "insufficient funds".to_owned(),
        });
        assert!(matches!(
            classify_submission(hash(), result),
            SubmitOutcome::Rejected(_)
        ));
    }

    #[test]
    fn receipt_found_resolves_immediately() {
        assert_eq!(
            receipt_transition(0, ReceiptOutcome::Found(1024)),
            ReceiptStep::Done(1024)
        );
        // A receipt observed on the final allowed poll still resolves fully.
        assert_eq!(
            receipt_transition(MAX_RETRIES - 1, ReceiptOutcome::Found(7)),
            ReceiptStep::Done(7)
        );
    }

    #[test]
    fn pending_consumes_retries_until_partial() {
        let mut retries = 0;
        let mut steps = 0;
        loop {
            match receipt_transition(retries, ReceiptOutcome::Pending) {
                ReceiptStep::Retry(next) => {
                    retries = next;
                    steps += 1;
                }
                ReceiptStep::Partial => break,
                ReceiptStep::Done(_) => panic!("pending never resolves fully"),
            }
        }
        // MAX_RETRIES polls in total: the budget-exhausting poll is the last.
        assert_eq!(steps, MAX_RETRIES - 1);
    }
}
