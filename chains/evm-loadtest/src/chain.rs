use anyhow::Result;
use core_logic::{is_nonce_retry_error, DispatchError, NetworkError, PollConfig};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rpc::ChainRpc;
use crate::utils::confirm::{wait_until_mined, CONFIRMATION_STEP, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::utils::gas::{
    build_transaction, dynamic_fees, floor_suggestion, legacy_fees, FeeParams, TxFields,
};
use crate::wallet::Identity;

/// A call sent during setup (deploy, mint, funding), gas estimated by the node.
#[derive(Debug, Clone)]
pub struct SetupCall {
    /// `None` deploys `data`.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

/// Connection-wide facts every sender needs.
#[derive(Clone)]
pub struct ChainContext {
    rpc: Arc<dyn ChainRpc>,
    chain_id: u64,
    legacy: bool,
    min_gas_price: U256,
}

impl std::fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainContext")
            .field("endpoint", &self.rpc.endpoint())
            .field("chain_id", &self.chain_id)
            .field("legacy", &self.legacy)
            .finish()
    }
}

impl ChainContext {
    pub fn new(rpc: Arc<dyn ChainRpc>, chain_id: u64, legacy: bool, min_gas_price: U256) -> Self {
        Self {
            rpc,
            chain_id,
            legacy,
            min_gas_price,
        }
    }

    /// Checks the node is usable and detects its fee market.
    ///
    /// A head block without a base fee marks the chain as legacy.
    pub async fn connect(rpc: Arc<dyn ChainRpc>, min_gas_price: U256) -> Result<Self> {
        if rpc.is_syncing().await? {
            return Err(NetworkError::Syncing {
                endpoint: rpc.endpoint().to_string(),
            }
            .into());
        }

        let chain_id = rpc.chain_id().await?;
        let legacy = rpc.latest_base_fee().await?.is_none();
        info!(
            endpoint = rpc.endpoint(),
            chain_id,
            legacy,
            "Connected to node"
        );

        Ok(Self::new(rpc, chain_id, legacy, min_gas_price))
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn min_gas_price(&self) -> U256 {
        self.min_gas_price
    }

    pub async fn head_base_fee(&self) -> Result<U256, DispatchError> {
        self.rpc.latest_base_fee().await?.ok_or_else(|| {
            NetworkError::InvalidResponse {
                endpoint: self.rpc.endpoint().to_string(),
                reason: "head block has no base fee".to_string(),
            }
            .into()
        })
    }

    /// Fees from fresh node suggestions, floored at `min_gas_price`.
    pub async fn suggested_fees(&self) -> Result<FeeParams, DispatchError> {
        if self.legacy {
            let price = floor_suggestion(self.rpc.suggest_gas_price().await?, self.min_gas_price);
            return Ok(legacy_fees(price, 1));
        }

        let tip = floor_suggestion(self.rpc.suggest_gas_tip().await?, self.min_gas_price);
        let base_fee = self.head_base_fee().await?;
        Ok(dynamic_fees(tip, base_fee, 1))
    }

    /// Signs and broadcasts `call` from `identity` under its nonce lock.
    ///
    /// A failure that is not a nonce-retry error hands the nonce back.
    pub async fn submit(&self, identity: &Identity, call: SetupCall) -> Result<H256, DispatchError> {
        let mut nonces = identity.lock_nonces().await;
        let nonce = nonces.assign(0);

        let result = self.sign_and_send(identity, call, nonce).await;
        if let Err(e) = &result {
            if !is_nonce_retry_error(&e.to_string()) {
                nonces.rollback(nonce);
            }
        }
        result
    }

    async fn sign_and_send(
        &self,
        identity: &Identity,
        call: SetupCall,
        nonce: u64,
    ) -> Result<H256, DispatchError> {
        let fees = self.suggested_fees().await?;
        let mut fields = TxFields {
            from: identity.address(),
            to: call.to,
            value: call.value,
            data: call.data,
            gas: None,
            nonce,
            chain_id: self.chain_id,
        };

        let estimate = self
            .rpc
            .estimate_gas(&build_transaction(fees, fields.clone()))
            .await?;
        fields.gas = Some(estimate);

        let tx = build_transaction(fees, fields);
        let (raw, hash) = identity.sign(&tx)?;
        self.rpc.send_raw_transaction(raw).await?;
        debug!(from = ?identity.address(), nonce, tx = ?hash, "Submitted setup transaction");
        Ok(hash)
    }

    /// Deploys `bytecode` from `identity` and waits for the contract address.
    pub async fn deploy(
        &self,
        identity: &Identity,
        bytecode: Bytes,
        token: &CancellationToken,
    ) -> Result<Address, DispatchError> {
        let hash = self
            .submit(
                identity,
                SetupCall {
                    to: None,
                    value: U256::zero(),
                    data: bytecode,
                },
            )
            .await?;

        let receipt = wait_until_mined(
            self.rpc.as_ref(),
            hash,
            PollConfig::new(DEFAULT_CONFIRMATION_TIMEOUT, CONFIRMATION_STEP),
            token,
        )
        .await?;

        receipt.contract_address.ok_or_else(|| {
            NetworkError::InvalidResponse {
                endpoint: self.rpc.endpoint().to_string(),
                reason: format!("receipt of {:?} has no contract address", hash),
            }
            .into()
        })
    }
}
