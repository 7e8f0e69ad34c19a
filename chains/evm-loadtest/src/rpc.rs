use async_trait::async_trait;
use core_logic::NetworkError;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Node's `txpool_status` answer. Counts arrive as hex quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    #[serde(rename = "baseFee", default, skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<U256>,
    #[serde(default)]
    pub pending: U64,
    #[serde(default)]
    pub queued: U64,
}

impl PoolStatus {
    pub fn backlog(&self) -> u64 {
        self.pending.as_u64().saturating_add(self.queued.as_u64())
    }
}

/// Block header fields plus transaction hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlimBlock {
    pub number: u64,
    pub timestamp: u64,
    pub gas_used: U256,
    pub transactions: Vec<H256>,
}

/// Everything the engine asks of a node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn chain_id(&self) -> Result<u64, NetworkError>;
    async fn block_number(&self) -> Result<u64, NetworkError>;
    async fn is_syncing(&self) -> Result<bool, NetworkError>;
    /// Base fee of the head block, `None` on chains without EIP-1559.
    async fn latest_base_fee(&self) -> Result<Option<U256>, NetworkError>;
    async fn suggest_gas_price(&self) -> Result<U256, NetworkError>;
    async fn suggest_gas_tip(&self) -> Result<U256, NetworkError>;
    async fn pending_nonce(&self, address: Address) -> Result<u64, NetworkError>;
    async fn balance(&self, address: Address) -> Result<U256, NetworkError>;
    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, NetworkError>;
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NetworkError>;
    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, NetworkError>;
    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, NetworkError>;
    async fn block(&self, number: u64) -> Result<Option<SlimBlock>, NetworkError>;
    async fn txpool_status(&self) -> Result<PoolStatus, NetworkError>;
    async fn request(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, NetworkError>;
}

/// [`ChainRpc`] over any ethers middleware stack.
#[derive(Debug, Clone)]
pub struct EthersRpc<M> {
    inner: Arc<M>,
    endpoint: String,
}

impl EthersRpc<Provider<Http>> {
    pub fn connect(url: &str) -> Result<Self, NetworkError> {
        let provider =
            Provider::<Http>::try_from(url).map_err(|e| NetworkError::ConnectionRefused {
                endpoint: crate::config::sanitize_url(url),
                reason: e.to_string(),
            })?;
        Ok(Self::new(Arc::new(provider), crate::config::sanitize_url(url)))
    }
}

impl<M: Middleware> EthersRpc<M> {
    pub fn new(inner: Arc<M>, endpoint: String) -> Self {
        Self { inner, endpoint }
    }
}

#[async_trait]
impl<M> ChainRpc for EthersRpc<M>
where
    M: Middleware + 'static,
{
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn chain_id(&self) -> Result<u64, NetworkError> {
        self.inner
            .get_chainid()
            .await
            .map(|id| id.as_u64())
            .map_err(|e| NetworkError::rpc("eth_chainId", e))
    }

    async fn block_number(&self) -> Result<u64, NetworkError> {
        self.inner
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| NetworkError::rpc("eth_blockNumber", e))
    }

    async fn is_syncing(&self) -> Result<bool, NetworkError> {
        let status = self
            .inner
            .syncing()
            .await
            .map_err(|e| NetworkError::rpc("eth_syncing", e))?;
        Ok(!matches!(status, SyncingStatus::IsFalse))
    }

    async fn latest_base_fee(&self) -> Result<Option<U256>, NetworkError> {
        let block = self
            .inner
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| NetworkError::rpc("eth_getBlockByNumber", e))?
            .ok_or_else(|| NetworkError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                reason: "latest block missing".to_string(),
            })?;
        Ok(block.base_fee_per_gas)
    }

    async fn suggest_gas_price(&self) -> Result<U256, NetworkError> {
        self.inner
            .get_gas_price()
            .await
            .map_err(|e| NetworkError::rpc("eth_gasPrice", e))
    }

    async fn suggest_gas_tip(&self) -> Result<U256, NetworkError> {
        self.inner
            .provider()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| NetworkError::rpc("eth_maxPriorityFeePerGas", e))
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, NetworkError> {
        self.inner
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| NetworkError::rpc("eth_getTransactionCount", e))
    }

    async fn balance(&self, address: Address) -> Result<U256, NetworkError> {
        self.inner
            .get_balance(address, None)
            .await
            .map_err(|e| NetworkError::rpc("eth_getBalance", e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, NetworkError> {
        self.inner
            .estimate_gas(tx, None)
            .await
            .map_err(|e| NetworkError::rpc("eth_estimateGas", e))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NetworkError> {
        let pending = self
            .inner
            .send_raw_transaction(raw)
            .await
            .map_err(|e| NetworkError::rpc("eth_sendRawTransaction", e))?;
        Ok(pending.tx_hash())
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, NetworkError> {
        self.inner
            .call(tx, None)
            .await
            .map_err(|e| NetworkError::rpc("eth_call", e))
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, NetworkError> {
        self.inner
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| NetworkError::rpc("eth_getTransactionReceipt", e))
    }

    async fn block(&self, number: u64) -> Result<Option<SlimBlock>, NetworkError> {
        let block = self
            .inner
            .get_block(BlockId::Number(BlockNumber::Number(number.into())))
            .await
            .map_err(|e| NetworkError::rpc("eth_getBlockByNumber", e))?;

        Ok(block.map(|b| SlimBlock {
            number: b.number.map(|n| n.as_u64()).unwrap_or(number),
            timestamp: b.timestamp.as_u64(),
            gas_used: b.gas_used,
            transactions: b.transactions,
        }))
    }

    async fn txpool_status(&self) -> Result<PoolStatus, NetworkError> {
        self.inner
            .provider()
            .request::<_, PoolStatus>("txpool_status", ())
            .await
            .map_err(|e| NetworkError::rpc("txpool_status", e))
    }

    async fn request(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, NetworkError> {
        self.inner
            .provider()
            .request::<_, serde_json::Value>(method, params)
            .await
            .map_err(|e| NetworkError::rpc(method, e))
    }
}
