use core_logic::{repeat_with_timeout, DispatchError, PollConfig};
use ethers::types::{TransactionReceipt, H256, U256};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::rpc::ChainRpc;

pub const CONFIRMATION_STEP: Duration = Duration::from_millis(10);
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(12);

/// Outcome of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxInfo {
    pub tx_hash: H256,
    pub status: bool,
    pub gas_used: U256,
    pub block_number: Option<u64>,
}

impl From<&TransactionReceipt> for TxInfo {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            status: receipt_succeeded(receipt),
            gas_used: receipt.gas_used.unwrap_or_default(),
            block_number: receipt.block_number.map(|n| n.as_u64()),
        }
    }
}

/// Receipts without a status field predate byzantium and count as success.
pub fn receipt_succeeded(receipt: &TransactionReceipt) -> bool {
    receipt.status.map_or(true, |s| s.as_u64() == 1)
}

/// Polls for the receipt of `hash` until it shows up, `poll.timeout` passes
/// or `token` fires.
pub async fn wait_for_receipt(
    rpc: &dyn ChainRpc,
    hash: H256,
    poll: PollConfig,
    token: &CancellationToken,
) -> Result<TransactionReceipt, DispatchError> {
    let receipt = repeat_with_timeout(token, poll, || async move {
        match rpc.receipt(hash).await {
            Ok(Some(receipt)) => Ok(receipt),
            Ok(None) => Err(format!("transaction {:?} not mined yet", hash)),
            Err(e) => Err(e.to_string()),
        }
    })
    .await?;
    Ok(receipt)
}

/// Like [`wait_for_receipt`], but a mined failure is `Reverted`.
pub async fn wait_until_mined(
    rpc: &dyn ChainRpc,
    hash: H256,
    poll: PollConfig,
    token: &CancellationToken,
) -> Result<TransactionReceipt, DispatchError> {
    let receipt = wait_for_receipt(rpc, hash, poll, token).await?;
    if receipt_succeeded(&receipt) {
        Ok(receipt)
    } else {
        Err(DispatchError::Reverted {
            tx_hash: format!("{:?}", hash),
        })
    }
}
