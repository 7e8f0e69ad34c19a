use chrono::Utc;
use core_logic::{
    is_nonce_retry_error, AdmissionLimiter, DispatchError, LatencyIndex, PollConfig,
};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address_pool::AddressPool;
use crate::chain::ChainContext;
use crate::contracts::{erc20_transfer_calldata, erc721_mint_batch_calldata};
use crate::report::Reporter;
use crate::utils::confirm::{wait_until_mined, CONFIRMATION_STEP, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::utils::gas::{
    build_transaction, dynamic_fees, legacy_fees, FeeParams, GasLimits, TxFields, LIMIT_TRANSFER,
};
use crate::utils::SharedCounter;
use crate::wallet::{Identity, IdentityPool, SharedWallets};

/// What a load transaction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxKind {
    /// 1 wei to a target.
    Transfer,
    /// `transfer(target, 1)` on the ERC20 contract.
    Erc20Transfer,
    /// `mintBatch(target, 1)` on the ERC721 contract.
    Erc721Mint,
}

impl TxKind {
    pub fn label(&self) -> &'static str {
        match self {
            TxKind::Transfer => "EIP155",
            TxKind::Erc20Transfer => "ERC20",
            TxKind::Erc721Mint => "ERC721",
        }
    }

    fn call_name(&self, confirmed: bool) -> &'static str {
        match (self, confirmed) {
            (TxKind::Transfer, false) => "sendTransaction",
            (TxKind::Transfer, true) => "sendConfirmedTransaction",
            (TxKind::Erc20Transfer, false) => "sendERC20Transaction",
            (TxKind::Erc20Transfer, true) => "sendConfirmedERC20Transaction",
            (TxKind::Erc721Mint, false) => "sendERC721Transaction",
            (TxKind::Erc721Mint, true) => "sendConfirmedERC721Transaction",
        }
    }
}

/// Per-request knobs.
#[derive(Debug, Clone)]
pub struct TxOptions {
    pub wait_for_confirmation: bool,
    pub confirmation_timeout: Duration,
    /// Simulate with `eth_call` instead of broadcasting.
    pub dry_run: bool,
    /// Pipelined sends start this far ahead of the identity's nonce.
    pub offset_nonce: u64,
    pub tx_count: u64,
    pub gas_price_multiplier: u64,
    /// Shared wallets the caller wants to send from.
    pub pinned: Vec<Address>,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            wait_for_confirmation: false,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            dry_run: false,
            offset_nonce: 0,
            tx_count: 1,
            gas_price_multiplier: 1,
            pinned: Vec::new(),
        }
    }
}

impl TxOptions {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.wait_for_confirmation && self.offset_nonce > 0 {
            return Err(invalid("cannot use offset nonce with confirmation"));
        }
        if self.tx_count == 0 {
            return Err(invalid("tx_count must be at least 1"));
        }
        if self.gas_price_multiplier == 0 {
            return Err(invalid("gas_price_multiplier must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> DispatchError {
    DispatchError::InvalidOptions {
        reason: reason.to_string(),
    }
}

/// A failed attempt and the nonce it used.
struct AttemptError {
    error: DispatchError,
    nonce: Option<u64>,
}

/// Builds, signs and submits load transactions.
pub struct Dispatcher {
    chain: ChainContext,
    testers: Arc<IdentityPool>,
    shared: Arc<SharedWallets>,
    targets: Arc<AddressPool>,
    gas_price: Arc<SharedCounter>,
    gas_tip: Arc<SharedCounter>,
    limiter: Option<Arc<AdmissionLimiter>>,
    latency: Option<Arc<LatencyIndex>>,
    record_dry_run_latency: bool,
    erc20: Option<Address>,
    erc721: Option<Address>,
    gas_limits: GasLimits,
    reporter: Option<Reporter>,
}

impl Dispatcher {
    pub fn new(chain: ChainContext, testers: Arc<IdentityPool>, targets: Arc<AddressPool>) -> Self {
        Self {
            chain,
            testers,
            shared: Arc::new(SharedWallets::new()),
            targets,
            gas_price: Arc::new(SharedCounter::default()),
            gas_tip: Arc::new(SharedCounter::default()),
            limiter: None,
            latency: None,
            record_dry_run_latency: false,
            erc20: None,
            erc721: None,
            gas_limits: GasLimits::default(),
            reporter: None,
        }
    }

    pub fn with_shared_wallets(mut self, shared: Arc<SharedWallets>) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_gas_counters(mut self, price: Arc<SharedCounter>, tip: Arc<SharedCounter>) -> Self {
        self.gas_price = price;
        self.gas_tip = tip;
        self
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<AdmissionLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_latency_index(mut self, index: Option<Arc<LatencyIndex>>) -> Self {
        self.latency = index;
        self
    }

    pub fn with_dry_run_latency(mut self, record: bool) -> Self {
        self.record_dry_run_latency = record;
        self
    }

    pub fn with_erc20(mut self, address: Option<Address>) -> Self {
        self.erc20 = address;
        self
    }

    pub fn with_erc721(mut self, address: Option<Address>) -> Self {
        self.erc721 = address;
        self
    }

    pub fn with_gas_limits(mut self, limits: GasLimits) -> Self {
        self.gas_limits = limits;
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn chain(&self) -> &ChainContext {
        &self.chain
    }

    pub async fn send_transfer(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Transfer, opts, token).await
    }

    pub async fn send_erc20(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Erc20Transfer, opts, token).await
    }

    pub async fn send_erc721(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Erc721Mint, opts, token).await
    }

    /// Sends `opts.tx_count` transactions of `kind` from one identity.
    ///
    /// Nonce-retry errors make the next iteration reuse the same nonce; any
    /// other error ends the request. Returns the hash of the last success.
    pub async fn send(
        &self,
        kind: TxKind,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        opts.validate()?;
        let contract = self.contract_for(kind)?;

        let (identity, _lease) = match self.shared.find(&opts.pinned) {
            Some(identity) => (identity, None),
            None => {
                let lease = self
                    .testers
                    .lease()
                    .ok_or(DispatchError::NoAvailableIdentity)?;
                (lease.identity().clone(), Some(lease))
            }
        };
        let target = self.targets.random().ok_or(DispatchError::EmptyAddressPool)?;

        let mut last_hash = None;
        let mut last_error: Option<DispatchError> = None;
        let mut retry_nonce: Option<u64> = None;
        let mut attempts = 0u64;

        for _ in 0..opts.tx_count {
            if token.is_cancelled() {
                break;
            }

            if let Some(limiter) = &self.limiter {
                if let Err(e) = limiter.wait(token).await {
                    if e.is_canceled() {
                        break;
                    }
                    last_error = Some(e);
                    continue;
                }
            }

            attempts += 1;
            let started = Instant::now();
            let sent = self
                .attempt(kind, &identity, target, contract, opts, retry_nonce.take())
                .await;

            let hash = match sent {
                Ok(hash) => hash,
                Err(AttemptError {
                    error,
                    nonce: Some(nonce),
                }) if is_nonce_retry_error(&error.to_string()) => {
                    debug!(
                        from = ?identity.address(),
                        nonce,
                        error = %error,
                        "Retrying with the same nonce"
                    );
                    retry_nonce = Some(nonce);
                    last_error = Some(error);
                    continue;
                }
                Err(AttemptError { error, .. }) => return Err(error),
            };

            self.record_submission(hash, opts.dry_run);
            if let Some(reporter) = &self.reporter {
                reporter.eoa(kind.label());
                reporter.req_duration(kind.call_name(false), started.elapsed());
            }

            if opts.wait_for_confirmation && !opts.dry_run {
                wait_until_mined(
                    self.chain.rpc().as_ref(),
                    hash,
                    PollConfig::new(opts.confirmation_timeout, CONFIRMATION_STEP),
                    token,
                )
                .await?;
                if let Some(reporter) = &self.reporter {
                    reporter.req_duration(kind.call_name(true), started.elapsed());
                }
            }

            last_hash = Some(hash);
        }

        if token.is_cancelled() && last_hash.is_none() {
            return Err(DispatchError::Canceled);
        }

        last_hash.ok_or_else(|| DispatchError::NoTransactionSent {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    fn contract_for(&self, kind: TxKind) -> Result<Option<Address>, DispatchError> {
        match kind {
            TxKind::Transfer => Ok(None),
            TxKind::Erc20Transfer => self
                .erc20
                .map(Some)
                .ok_or(DispatchError::ContractNotInitialized { contract: "ERC20" }),
            TxKind::Erc721Mint => self
                .erc721
                .map(Some)
                .ok_or(DispatchError::ContractNotInitialized { contract: "ERC721" }),
        }
    }

    /// One nonce, one signed transaction, one submission.
    async fn attempt(
        &self,
        kind: TxKind,
        identity: &Identity,
        target: Address,
        contract: Option<Address>,
        opts: &TxOptions,
        retry_nonce: Option<u64>,
    ) -> Result<H256, AttemptError> {
        let mut nonces = identity.lock_nonces().await;
        let nonce = match retry_nonce {
            Some(nonce) => nonce,
            None => nonces.assign(opts.offset_nonce),
        };

        let result = self
            .sign_and_submit(kind, identity, target, contract, opts, nonce)
            .await;
        if let Err(e) = &result {
            if !is_nonce_retry_error(&e.to_string()) {
                nonces.rollback(nonce);
            }
        }
        drop(nonces);

        result.map_err(|error| AttemptError {
            error,
            nonce: Some(nonce),
        })
    }

    async fn sign_and_submit(
        &self,
        kind: TxKind,
        identity: &Identity,
        target: Address,
        contract: Option<Address>,
        opts: &TxOptions,
        nonce: u64,
    ) -> Result<H256, DispatchError> {
        let fees = self.fees(opts.gas_price_multiplier).await?;

        let (to, value, data, gas) = match (kind, contract) {
            (TxKind::Erc20Transfer, Some(contract)) => (
                contract,
                U256::zero(),
                erc20_transfer_calldata(target, U256::one()),
                U256::from(self.gas_limits.erc20_transfer),
            ),
            (TxKind::Erc721Mint, Some(contract)) => (
                contract,
                U256::zero(),
                erc721_mint_batch_calldata(target, U256::one()),
                U256::from(self.gas_limits.erc721_mint),
            ),
            _ => (target, U256::one(), Bytes::default(), LIMIT_TRANSFER),
        };

        let tx = build_transaction(
            fees,
            TxFields {
                from: identity.address(),
                to: Some(to),
                value,
                data,
                gas: Some(gas),
                nonce,
                chain_id: self.chain.chain_id(),
            },
        );
        let (raw, hash) = identity.sign(&tx)?;

        if opts.dry_run {
            self.chain.rpc().call(&tx).await?;
        } else {
            self.chain.rpc().send_raw_transaction(raw).await?;
        }
        Ok(hash)
    }

    async fn fees(&self, multiplier: u64) -> Result<FeeParams, DispatchError> {
        if self.chain.is_legacy() {
            return Ok(legacy_fees(self.gas_price.load(), multiplier));
        }
        let base_fee = self.chain.head_base_fee().await?;
        Ok(dynamic_fees(self.gas_tip.load(), base_fee, multiplier))
    }

    fn record_submission(&self, hash: H256, dry_run: bool) {
        if dry_run && !self.record_dry_run_latency {
            return;
        }
        if let Some(index) = &self.latency {
            index.record(format!("{:?}", hash), Utc::now().timestamp_millis());
        }
    }
}
