use anyhow::{Context, Result};
use chrono::Utc;
use core_logic::{
    AdmissionLimiter, DispatchError, LatencyIndex, MetricsCollector, NetworkError, PollConfig,
};
use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::address_pool::AddressPool;
use crate::chain::{ChainContext, SetupCall};
use crate::config::EndpointConfig;
use crate::contract_calls::{
    deploy_data, load_abi, load_init_code, ContractCall, ContractRegistry, DeployContractParams,
    DeployedContract, CONTRACT_CALL,
};
use crate::contracts::{deploy_or_attach, mint_erc20_all, mint_erc721_all, ContractKind};
use crate::dispatcher::{Dispatcher, TxKind, TxOptions};
use crate::funder::{BatchFunder, FundingOrchestrator};
use crate::report::{BlockReport, Reporter};
use crate::rpc::{ChainRpc, PoolStatus};
use crate::utils::confirm::{wait_for_receipt, TxInfo};
use crate::utils::gas::floor_suggestion;
use crate::utils::SharedCounter;
use crate::wallet::{IdentityPool, SharedWallets, WALLETS_TIMEOUT};

pub const GAS_REFRESH_INTERVAL: Duration = Duration::from_millis(100);
pub const POOL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TX_INFO_POLL: PollConfig = PollConfig::new(Duration::from_secs(20), Duration::from_millis(500));
/// Head timestamps further behind the local clock than this are logged and kept.
const CLOCK_SKEW_THRESHOLD_MS: i64 = 10_000;

/// Run-wide handles every client of a run shares.
#[derive(Clone)]
pub struct RunContext {
    pub run_uid: String,
    pub metrics: Arc<MetricsCollector>,
    pub latency: Option<Arc<LatencyIndex>>,
}

/// Last block the report loop looked at, and when.
#[derive(Debug, Clone, Copy)]
struct ReportState {
    number: u64,
    observed_at_ms: i64,
}

/// Everything the engine holds for one endpoint.
pub struct LoadClient {
    uid: String,
    chain: ChainContext,
    dispatcher: Dispatcher,
    testers: Arc<IdentityPool>,
    sponsors: Arc<IdentityPool>,
    shared: Arc<SharedWallets>,
    targets: Arc<AddressPool>,
    limiter: Option<Arc<AdmissionLimiter>>,
    pool_status: Arc<RwLock<PoolStatus>>,
    report: Mutex<ReportState>,
    first_block: u64,
    clock_skew_ms: i64,
    latency: Option<Arc<LatencyIndex>>,
    reporter: Reporter,
    erc20: Option<Address>,
    erc721: Option<Address>,
    contracts: ContractRegistry,
    token: CancellationToken,
}

impl std::fmt::Debug for LoadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadClient")
            .field("uid", &self.uid)
            .field("chain", &self.chain)
            .field("testers", &self.testers.count())
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl LoadClient {
    /// Prepares an endpoint for load: checks the node, builds the wallet and
    /// target pools, funds generated wallets, sets up the token contracts and
    /// starts the gas and pool background loops.
    pub async fn connect(
        config: &EndpointConfig,
        rpc: Arc<dyn ChainRpc>,
        run: RunContext,
        token: &CancellationToken,
    ) -> Result<Self> {
        let uid = config.sanitized_url();
        let span = info_span!("client", uid = %uid);
        Self::setup(config, rpc, run, uid, token).instrument(span).await
    }

    async fn setup(
        config: &EndpointConfig,
        rpc: Arc<dyn ChainRpc>,
        run: RunContext,
        uid: String,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let token = parent.child_token();
        let chain = ChainContext::connect(rpc.clone(), config.min_gas_price).await?;

        let targets = Arc::new(
            AddressPool::from_config(&config.target_addresses, config.num_target_addresses, &token)
                .await?,
        );

        let first_block = rpc.block_number().await?;
        let now_ms = Utc::now().timestamp_millis();
        let head = rpc
            .block(first_block)
            .await?
            .with_context(|| format!("head block {} not found", first_block))?;
        let lag_ms = now_ms - (head.timestamp as i64).saturating_mul(1000);
        let clock_skew_ms = if lag_ms > CLOCK_SKEW_THRESHOLD_MS {
            warn!(lag_ms, "Node head timestamp lags the local clock");
            lag_ms
        } else {
            0
        };

        let (sponsors, testers) = tokio::time::timeout(
            WALLETS_TIMEOUT,
            Self::setup_wallets(config, &chain, &token),
        )
        .await
        .map_err(|_| NetworkError::Timeout {
            timeout_ms: WALLETS_TIMEOUT.as_millis() as u64,
            endpoint: uid.clone(),
        })??;

        let erc20 = if config.erc20 {
            let address = deploy_or_attach(
                &chain,
                &sponsors,
                ContractKind::Erc20,
                config.erc20_address,
                &config.artifacts_dir,
                &token,
            )
            .await?;
            mint_erc20_all(&chain, &testers, address, config.erc20_mint_amount, &token)
                .await
                .context("ERC20 mint failed")?;
            Some(address)
        } else {
            None
        };

        let erc721 = if config.erc721 {
            let address = deploy_or_attach(
                &chain,
                &sponsors,
                ContractKind::Erc721,
                config.erc721_address,
                &config.artifacts_dir,
                &token,
            )
            .await?;
            if config.erc721_mint {
                mint_erc721_all(&chain, &testers, address, &token)
                    .await
                    .context("ERC721 mint failed")?;
            }
            Some(address)
        } else {
            None
        };

        let gas_price = Arc::new(SharedCounter::default());
        let gas_tip = Arc::new(SharedCounter::default());
        refresh_gas(&chain, &gas_price, &gas_tip).await?;
        tokio::spawn(gas_refresh_loop(
            chain.clone(),
            gas_price.clone(),
            gas_tip.clone(),
            token.clone(),
        ));

        let limiter = config
            .admission_config()
            .map(|c| Arc::new(AdmissionLimiter::new(c)));
        let pool_status = Arc::new(RwLock::new(PoolStatus::default()));
        tokio::spawn(pool_poll_loop(
            rpc.clone(),
            pool_status.clone(),
            limiter.clone().filter(|_| config.adaptive_rate_limit),
            token.clone(),
        ));

        let reporter = Reporter::new(run.metrics.clone(), uid.clone(), run.run_uid.clone());
        let shared = Arc::new(SharedWallets::new());
        let dispatcher = Dispatcher::new(chain.clone(), testers.clone(), targets.clone())
            .with_shared_wallets(shared.clone())
            .with_gas_counters(gas_price, gas_tip)
            .with_limiter(limiter.clone())
            .with_latency_index(run.latency.clone())
            .with_dry_run_latency(config.record_dry_run_latency)
            .with_erc20(erc20)
            .with_erc721(erc721)
            .with_gas_limits(config.gas_limits)
            .with_reporter(reporter.clone());

        info!(
            wallets = testers.count(),
            sponsors = sponsors.count(),
            targets = targets.len(),
            first_block,
            "Client ready"
        );

        Ok(Self {
            uid,
            chain,
            dispatcher,
            testers,
            sponsors,
            shared,
            targets,
            limiter,
            pool_status,
            report: Mutex::new(ReportState {
                number: first_block,
                observed_at_ms: now_ms,
            }),
            first_block,
            clock_skew_ms,
            latency: run.latency,
            reporter,
            erc20,
            erc721,
            contracts: ContractRegistry::new(),
            token,
        })
    }

    /// Sponsors from `private_keys`; testers from `wallets` plus
    /// `num_wallets` generated identities funded through the batch funder.
    async fn setup_wallets(
        config: &EndpointConfig,
        chain: &ChainContext,
        token: &CancellationToken,
    ) -> Result<(Arc<IdentityPool>, Arc<IdentityPool>)> {
        let sponsors = Arc::new(
            IdentityPool::from_private_keys(&config.private_keys, chain.rpc().clone(), token)
                .await
                .context("Failed to load sponsor keys")?,
        );
        let testers = Arc::new(
            IdentityPool::from_private_keys(&config.wallets, chain.rpc().clone(), token)
                .await
                .context("Failed to load wallet keys")?,
        );

        if config.num_wallets == 0 {
            return Ok((sponsors, testers));
        }

        let generated = IdentityPool::new();
        generated.generate(config.num_wallets, token).await?;

        let funder = match config.batch_funder_address {
            Some(address) => BatchFunder::at(address),
            None => BatchFunder::deploy(chain, &sponsors, &config.artifacts_dir, token).await?,
        };
        FundingOrchestrator::new(chain.clone(), funder, sponsors.clone())
            .fund(&generated.addresses(), config.fund_amount, token)
            .await
            .context("Funding generated wallets failed")?;

        for identity in generated.all() {
            testers.register(identity);
        }
        Ok((sponsors, testers))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn chain(&self) -> &ChainContext {
        &self.chain
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn testers(&self) -> &Arc<IdentityPool> {
        &self.testers
    }

    pub fn sponsors(&self) -> &Arc<IdentityPool> {
        &self.sponsors
    }

    pub fn targets(&self) -> &Arc<AddressPool> {
        &self.targets
    }

    pub fn limiter(&self) -> Option<&Arc<AdmissionLimiter>> {
        self.limiter.as_ref()
    }

    pub fn erc20_address(&self) -> Option<Address> {
        self.erc20
    }

    pub fn erc721_address(&self) -> Option<Address> {
        self.erc721
    }

    pub fn first_block_number(&self) -> u64 {
        self.first_block
    }

    /// How far the head timestamp lagged at connect, 0 when under 10s.
    pub fn clock_skew_ms(&self) -> i64 {
        self.clock_skew_ms
    }

    pub async fn send(
        &self,
        kind: TxKind,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.dispatcher.send(kind, opts, token).await
    }

    pub async fn send_transaction(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Transfer, opts, token).await
    }

    pub async fn send_erc20_transaction(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Erc20Transfer, opts, token).await
    }

    pub async fn send_erc721_transaction(
        &self,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> Result<H256, DispatchError> {
        self.send(TxKind::Erc721Mint, opts, token).await
    }

    /// Locks a free tester and keeps it for the caller until released.
    pub fn request_shared_wallet(&self) -> Result<Address, DispatchError> {
        self.shared
            .reserve(&self.testers)
            .ok_or(DispatchError::NoAvailableIdentity)
    }

    pub fn release_shared_wallet(&self, address: &Address) -> bool {
        self.shared.release(&self.testers, address)
    }

    /// Deploys a contract from a free tester and remembers its ABI for
    /// [`tx_contract`](Self::tx_contract) and [`call_contract`](Self::call_contract).
    pub async fn deploy_contract(
        &self,
        params: &DeployContractParams,
        token: &CancellationToken,
    ) -> Result<DeployedContract, DispatchError> {
        let abi = load_abi(&params.abi_path)?;
        let data = deploy_data(
            &abi,
            load_init_code(&params.bin_path)?,
            &params.constructor_args,
        )?;

        let lease = self
            .testers
            .lease()
            .ok_or(DispatchError::NoAvailableIdentity)?;
        let deployer = lease.identity().address();
        let address = self.chain.deploy(lease.identity(), data, token).await?;
        self.contracts.insert(address, abi);

        info!(contract = ?address, deployer = ?deployer, "Deployed contract");
        Ok(DeployedContract { deployer, address })
    }

    /// Registers the ABI of an already deployed contract.
    pub fn attach_contract(&self, address: Address, abi_path: &Path) -> Result<(), DispatchError> {
        self.contracts.insert(address, load_abi(abi_path)?);
        Ok(())
    }

    /// Sends `method(args)` to a known contract from a free tester.
    pub async fn tx_contract(&self, call: &ContractCall) -> Result<H256, DispatchError> {
        let data = self.contracts.encode(call)?;
        let lease = self
            .testers
            .lease()
            .ok_or(DispatchError::NoAvailableIdentity)?;

        let started = Instant::now();
        let hash = self
            .chain
            .submit(
                lease.identity(),
                SetupCall {
                    to: Some(call.address),
                    value: U256::zero(),
                    data,
                },
            )
            .await?;
        self.reporter.req_duration(CONTRACT_CALL, started.elapsed());
        Ok(hash)
    }

    /// Evaluates `method(args)` on a known contract without a transaction.
    pub async fn call_contract(&self, call: &ContractCall) -> Result<Vec<Token>, DispatchError> {
        let request = self.contracts.view_request(call)?;
        let started = Instant::now();
        let output = self.chain.rpc().call(&request).await?;
        self.reporter.req_duration(CONTRACT_CALL, started.elapsed());
        self.contracts.decode_output(call, &output)
    }

    /// Reports throughput for the head block once it has moved past the last
    /// reported one. Returns `None` when the head has not advanced.
    pub async fn report_block_metrics(&self) -> Result<Option<BlockReport>, DispatchError> {
        let mut state = self.report.lock().await;

        let number = self.chain.rpc().block_number().await?;
        if number <= state.number {
            return Ok(None);
        }

        let now_ms = Utc::now().timestamp_millis();
        let elapsed_ms = u64::try_from(now_ms - state.observed_at_ms).unwrap_or(0);
        *state = ReportState {
            number,
            observed_at_ms: now_ms,
        };

        let block = self.chain.rpc().block(number).await?.ok_or_else(|| {
            NetworkError::InvalidResponse {
                endpoint: self.chain.rpc().endpoint().to_string(),
                reason: format!("block {} not found", number),
            }
        })?;
        drop(state);

        let gas_used = if block.gas_used > U256::from(u64::MAX) {
            u64::MAX
        } else {
            block.gas_used.as_u64()
        };
        let report = BlockReport::compute(number, block.transactions.len() as u64, gas_used, elapsed_ms)
            .with_head_lag(now_ms, block.timestamp, self.clock_skew_ms);
        self.reporter.block(&report);
        self.spawn_latency_report(block.transactions, now_ms);

        Ok(Some(report))
    }

    fn spawn_latency_report(&self, hashes: Vec<H256>, observed_at_ms: i64) {
        let Some(index) = self.latency.clone() else {
            return;
        };
        if hashes.is_empty() {
            return;
        }

        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            for hash in hashes {
                match index.get(&format!("{:?}", hash)).await {
                    Ok(Some(submitted_at_ms)) => {
                        reporter.time_to_mine((observed_at_ms - submitted_at_ms) as f64);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(tx = ?hash, "Latency lookup failed: {}", e),
                }
            }
        });
    }

    /// Last polled pool status; also emits the pending and queued samples.
    pub fn tx_pool_status(&self) -> PoolStatus {
        let status = self
            .pool_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.reporter.pool(&status);
        status
    }

    /// Waits up to 20s for `hash` to be mined.
    pub async fn tx_info(&self, hash: H256, token: &CancellationToken) -> Result<TxInfo, DispatchError> {
        let started = Instant::now();
        let receipt = wait_for_receipt(self.chain.rpc().as_ref(), hash, TX_INFO_POLL, token).await?;
        self.reporter.req_duration("getTxInfo", started.elapsed());
        Ok(TxInfo::from(&receipt))
    }

    pub async fn chain_id(&self) -> Result<u64, DispatchError> {
        let started = Instant::now();
        let id = self.chain.rpc().chain_id().await?;
        self.reporter.req_duration("chainId", started.elapsed());
        Ok(id)
    }

    /// Raw JSON-RPC passthrough.
    pub async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, DispatchError> {
        let started = Instant::now();
        let result = self.chain.rpc().request(method, params).await?;
        self.reporter.req_duration(method, started.elapsed());
        Ok(result)
    }

    /// Stops the background loops and any setup still in flight.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for LoadClient {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Stores fresh node suggestions, floored at the configured minimum.
async fn refresh_gas(
    chain: &ChainContext,
    gas_price: &SharedCounter,
    gas_tip: &SharedCounter,
) -> Result<(), DispatchError> {
    let rpc = chain.rpc();
    if chain.is_legacy() {
        let price = rpc.suggest_gas_price().await?;
        gas_price.store(floor_suggestion(price, chain.min_gas_price()));
    } else {
        let tip = rpc.suggest_gas_tip().await?;
        gas_tip.store(floor_suggestion(tip, chain.min_gas_price()));
    }
    Ok(())
}

async fn gas_refresh_loop(
    chain: ChainContext,
    gas_price: Arc<SharedCounter>,
    gas_tip: Arc<SharedCounter>,
    token: CancellationToken,
) {
    let mut ticker = interval(GAS_REFRESH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = refresh_gas(&chain, &gas_price, &gas_tip).await {
            debug!("Gas refresh failed: {}", e);
        }
    }
}

/// Keeps `status` current and, for adaptive clients, retunes the limiter
/// against the backlog.
async fn pool_poll_loop(
    rpc: Arc<dyn ChainRpc>,
    status: Arc<RwLock<PoolStatus>>,
    adaptive: Option<Arc<AdmissionLimiter>>,
    token: CancellationToken,
) {
    let mut ticker = interval(POOL_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let polled = match rpc.txpool_status().await {
            Ok(polled) => polled,
            Err(e) => {
                debug!("Pool status poll failed: {}", e);
                continue;
            }
        };

        if let Some(limiter) = &adaptive {
            let rate = limiter.retune(polled.backlog());
            debug!(backlog = polled.backlog(), rate, "Retuned admission rate");
        }
        *status.write().unwrap_or_else(PoisonError::into_inner) = polled;
    }
}
