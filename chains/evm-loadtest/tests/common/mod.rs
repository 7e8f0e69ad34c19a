#![allow(dead_code)]

use async_trait::async_trait;
use core_logic::NetworkError;
use ethers::abi::{AbiDecode, AbiEncode};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use ethers::utils::{get_contract_address, keccak256, rlp::Rlp};
use evm_loadtest::chain::ChainContext;
use evm_loadtest::contracts::{BatchSendCall, MintCall, TransferCall};
use evm_loadtest::rpc::{ChainRpc, PoolStatus, SlimBlock};
use evm_loadtest::wallet::Identity;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

pub const CHAIN_ID: u64 = 1337;

/// One decoded `eth_sendRawTransaction`.
#[derive(Debug, Clone)]
pub struct SentTx {
    pub hash: H256,
    pub from: Address,
    pub tx: TypedTransaction,
}

impl SentTx {
    pub fn nonce(&self) -> u64 {
        self.tx.nonce().map(|n| n.as_u64()).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct FakeState {
    pub chain_id: u64,
    pub syncing: bool,
    pub block_number: u64,
    pub base_fee: Option<U256>,
    pub gas_price: U256,
    pub gas_tip: U256,
    pub estimate: U256,
    /// Mine every accepted transaction immediately.
    pub auto_mine: bool,
    pub nonces: HashMap<Address, u64>,
    pub balances: HashMap<Address, U256>,
    /// Keyed by (contract, owner).
    pub erc20_balances: HashMap<(Address, Address), U256>,
    /// Popped one per broadcast, before decoding.
    pub send_errors: VecDeque<String>,
    pub sent: Vec<SentTx>,
    pub calls: Vec<TypedTransaction>,
    pub requests: Vec<(String, Vec<serde_json::Value>)>,
    pub receipts: HashMap<H256, TransactionReceipt>,
    pub blocks: HashMap<u64, SlimBlock>,
    pub pool: PoolStatus,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            chain_id: CHAIN_ID,
            syncing: false,
            block_number: 1,
            base_fee: Some(U256::from(1_000_000_000u64)),
            gas_price: U256::from(1_000_000_000u64),
            gas_tip: U256::from(2_000_000_000u64),
            estimate: U256::from(100_000u64),
            auto_mine: true,
            nonces: HashMap::new(),
            balances: HashMap::new(),
            erc20_balances: HashMap::new(),
            send_errors: VecDeque::new(),
            sent: Vec::new(),
            calls: Vec::new(),
            requests: Vec::new(),
            receipts: HashMap::new(),
            blocks: HashMap::new(),
            pool: PoolStatus::default(),
        }
    }
}

/// Scripted node: accepts signed transactions, applies the few contract
/// effects setup relies on and answers from in-memory state.
#[derive(Debug, Default)]
pub struct FakeRpc {
    state: Mutex<FakeState>,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A chain without a base fee.
    pub fn legacy() -> Arc<Self> {
        let rpc = Self::new();
        rpc.state().base_fee = None;
        rpc
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_send_error(&self, message: &str) {
        self.state().send_errors.push_back(message.to_string());
    }

    pub fn sent(&self) -> Vec<SentTx> {
        self.state().sent.clone()
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn erc20_balance_of(&self, contract: Address, owner: Address) -> U256 {
        self.state()
            .erc20_balances
            .get(&(contract, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Adds block `number` with `txs` and moves the head to it.
    pub fn mine_block(&self, number: u64, txs: Vec<H256>, gas_used: u64) {
        let mut state = self.state();
        state.block_number = number;
        state.blocks.insert(
            number,
            SlimBlock {
                number,
                timestamp: now_secs(),
                gas_used: U256::from(gas_used),
                transactions: txs,
            },
        );
    }

    fn accept(state: &mut FakeState, raw: &Bytes) -> Result<H256, NetworkError> {
        let rlp = Rlp::new(raw.as_ref());
        let (tx, sig) = TypedTransaction::decode_signed(&rlp)
            .map_err(|e| NetworkError::rpc("eth_sendRawTransaction", e))?;
        let from = sig
            .recover(tx.sighash())
            .map_err(|e| NetworkError::rpc("eth_sendRawTransaction", e))?;
        let hash = H256::from(keccak256(raw.as_ref()));
        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();

        let expected = state.nonces.get(&from).copied().unwrap_or_default();
        if nonce < expected {
            return Err(NetworkError::rpc("eth_sendRawTransaction", "nonce too low"));
        }
        state.nonces.insert(from, nonce + 1);

        let data = tx.data().cloned().unwrap_or_default();
        let value = tx.value().copied().unwrap_or_default();
        let to = tx.to().and_then(|to| to.as_address().copied());

        let mut contract_address = None;
        match to {
            None => contract_address = Some(get_contract_address(from, nonce)),
            Some(to) => {
                if let Ok(call) = BatchSendCall::decode(data.as_ref()) {
                    for recipient in call.recipients {
                        *state.balances.entry(recipient).or_default() += call.amount;
                    }
                } else if let Ok(call) = MintCall::decode(data.as_ref()) {
                    *state.erc20_balances.entry((to, from)).or_default() += call.amount;
                } else if let Ok(call) = TransferCall::decode(data.as_ref()) {
                    *state.erc20_balances.entry((to, call.to)).or_default() += call.amount;
                } else if data.is_empty() {
                    *state.balances.entry(to).or_default() += value;
                }
            }
        }

        state.sent.push(SentTx {
            hash,
            from,
            tx,
        });

        if state.auto_mine {
            let receipt = TransactionReceipt {
                transaction_hash: hash,
                from,
                to,
                contract_address,
                status: Some(U64::from(1)),
                block_number: Some(U64::from(state.block_number)),
                gas_used: Some(state.estimate),
                ..Default::default()
            };
            state.receipts.insert(hash, receipt);
        }
        Ok(hash)
    }
}

pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[async_trait]
impl ChainRpc for FakeRpc {
    fn endpoint(&self) -> &str {
        "http://fake-node/"
    }

    async fn chain_id(&self) -> Result<u64, NetworkError> {
        Ok(self.state().chain_id)
    }

    async fn block_number(&self) -> Result<u64, NetworkError> {
        Ok(self.state().block_number)
    }

    async fn is_syncing(&self) -> Result<bool, NetworkError> {
        Ok(self.state().syncing)
    }

    async fn latest_base_fee(&self) -> Result<Option<U256>, NetworkError> {
        Ok(self.state().base_fee)
    }

    async fn suggest_gas_price(&self) -> Result<U256, NetworkError> {
        Ok(self.state().gas_price)
    }

    async fn suggest_gas_tip(&self) -> Result<U256, NetworkError> {
        Ok(self.state().gas_tip)
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, NetworkError> {
        Ok(self.state().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn balance(&self, address: Address) -> Result<U256, NetworkError> {
        Ok(self.balance_of(address))
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, NetworkError> {
        Ok(self.state().estimate)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, NetworkError> {
        let mut state = self.state();
        if let Some(message) = state.send_errors.pop_front() {
            return Err(NetworkError::rpc("eth_sendRawTransaction", message));
        }
        Self::accept(&mut state, &raw)
    }

    async fn call(&self, tx: &TypedTransaction) -> Result<Bytes, NetworkError> {
        let mut state = self.state();
        state.calls.push(tx.clone());

        let data = tx.data().cloned().unwrap_or_default();
        let contract = tx.to().and_then(|to| to.as_address().copied());
        let balance_of = ethers::utils::id("balanceOf(address)");
        match contract {
            Some(contract) if data.len() == 36 && data[..4] == balance_of => {
                let owner = Address::from_slice(&data[16..36]);
                let balance = state
                    .erc20_balances
                    .get(&(contract, owner))
                    .copied()
                    .unwrap_or_default();
                Ok(balance.encode().into())
            }
            _ => Ok(Bytes::default()),
        }
    }

    async fn receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, NetworkError> {
        Ok(self.state().receipts.get(&hash).cloned())
    }

    async fn block(&self, number: u64) -> Result<Option<SlimBlock>, NetworkError> {
        let state = self.state();
        if let Some(block) = state.blocks.get(&number) {
            return Ok(Some(block.clone()));
        }
        if number > state.block_number {
            return Ok(None);
        }
        Ok(Some(SlimBlock {
            number,
            timestamp: now_secs(),
            ..Default::default()
        }))
    }

    async fn txpool_status(&self) -> Result<PoolStatus, NetworkError> {
        Ok(self.state().pool.clone())
    }

    async fn request(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, NetworkError> {
        self.state()
            .requests
            .push((method.to_string(), params.clone()));
        Ok(serde_json::json!({ "method": method, "params": params }))
    }
}

/// Chain context over `rpc`, reading its fee market from the scripted state.
pub fn context(rpc: &Arc<FakeRpc>) -> ChainContext {
    let (chain_id, legacy) = {
        let state = rpc.state();
        (state.chain_id, state.base_fee.is_none())
    };
    ChainContext::new(rpc.clone(), chain_id, legacy, U256::zero())
}

/// A fresh identity whose nonce matches the fake node.
pub fn identity_at(rpc: &FakeRpc, nonce: u64) -> Arc<Identity> {
    let signer = LocalWallet::new(&mut rand::thread_rng());
    rpc.set_nonce(signer.address(), nonce);
    Arc::new(Identity::new(signer, nonce))
}
