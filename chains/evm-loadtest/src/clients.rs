use anyhow::{Context, Result};
use core_logic::{AsyncDbConfig, DispatchError, LatencyIndex, MetricsCollector};
use ethers::abi::Token;
use ethers::types::{Address, H256};
use futures::future::{join_all, try_join_all};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{LoadClient, RunContext};
use crate::config::{EndpointConfig, LoadTestConfig};
use crate::contract_calls::{ContractCall, DeployContractParams, DeployedContract};
use crate::dispatcher::{TxKind, TxOptions};
use crate::report::BlockReport;
use crate::rpc::{ChainRpc, PoolStatus};
use crate::utils::confirm::TxInfo;

/// Outcome of one operation on one endpoint.
pub type EndpointResult<T> = Result<T, DispatchError>;

/// Builds the node connection for an endpoint.
pub type RpcFactory = dyn Fn(&EndpointConfig) -> Result<Arc<dyn ChainRpc>> + Send + Sync;

/// Every endpoint client of one run.
#[derive(Debug)]
pub struct Clients {
    run_uid: String,
    clients: Vec<Arc<LoadClient>>,
}

impl Clients {
    pub fn new(run_uid: String, clients: Vec<Arc<LoadClient>>) -> Self {
        Self { run_uid, clients }
    }

    /// Connects every endpoint of `config` concurrently. `latencies[i]` is the
    /// index of endpoint `i`. One failing endpoint fails the whole run setup.
    pub async fn connect(
        config: &LoadTestConfig,
        run_uid: &str,
        metrics: Arc<MetricsCollector>,
        latencies: &[Option<Arc<LatencyIndex>>],
        rpc_factory: &RpcFactory,
        token: &CancellationToken,
    ) -> Result<Self> {
        let pending = config.endpoints.iter().enumerate().map(|(i, endpoint)| {
            let run = RunContext {
                run_uid: run_uid.to_string(),
                metrics: metrics.clone(),
                latency: latencies.get(i).cloned().flatten(),
            };
            async move {
                let rpc = rpc_factory(endpoint)?;
                let client = LoadClient::connect(endpoint, rpc, run, token)
                    .await
                    .with_context(|| format!("Failed to set up {}", endpoint.sanitized_url()))?;
                anyhow::Ok(Arc::new(client))
            }
        });

        let clients = try_join_all(pending).await?;
        info!(run_uid, endpoints = clients.len(), "Run connected");
        Ok(Self::new(run_uid.to_string(), clients))
    }

    pub fn run_uid(&self) -> &str {
        &self.run_uid
    }

    pub fn clients(&self) -> &[Arc<LoadClient>] {
        &self.clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Runs `op` against every client concurrently, keyed by client uid.
    pub async fn execute_on_all<T, F, Fut>(&self, op: F) -> BTreeMap<String, EndpointResult<T>>
    where
        F: Fn(Arc<LoadClient>) -> Fut,
        Fut: Future<Output = EndpointResult<T>>,
    {
        let results = join_all(self.clients.iter().map(|client| {
            let uid = client.uid().to_string();
            let fut = op(client.clone());
            async move { (uid, fut.await) }
        }))
        .await;
        results.into_iter().collect()
    }

    pub async fn send_transaction(
        &self,
        kind: TxKind,
        opts: &TxOptions,
        token: &CancellationToken,
    ) -> BTreeMap<String, EndpointResult<H256>> {
        self.execute_on_all(|client| {
            let opts = opts.clone();
            let token = token.clone();
            async move { client.send(kind, &opts, &token).await }
        })
        .await
    }

    pub async fn request_shared_wallet(&self) -> BTreeMap<String, EndpointResult<Address>> {
        self.execute_on_all(|client| async move { client.request_shared_wallet() })
            .await
    }

    /// Releases `addresses` wherever they are reserved.
    pub async fn release_shared_wallet(
        &self,
        addresses: &[Address],
    ) -> BTreeMap<String, EndpointResult<bool>> {
        self.execute_on_all(|client| {
            let addresses = addresses.to_vec();
            async move {
                Ok(addresses
                    .iter()
                    .fold(false, |released, a| client.release_shared_wallet(a) || released))
            }
        })
        .await
    }

    pub async fn report_block_metrics(
        &self,
    ) -> BTreeMap<String, EndpointResult<Option<BlockReport>>> {
        self.execute_on_all(|client| async move { client.report_block_metrics().await })
            .await
    }

    pub async fn tx_pool_status(&self) -> BTreeMap<String, EndpointResult<PoolStatus>> {
        self.execute_on_all(|client| async move { Ok(client.tx_pool_status()) })
            .await
    }

    pub async fn tx_info(
        &self,
        hash: H256,
        token: &CancellationToken,
    ) -> BTreeMap<String, EndpointResult<TxInfo>> {
        self.execute_on_all(|client| {
            let token = token.clone();
            async move { client.tx_info(hash, &token).await }
        })
        .await
    }

    pub async fn chain_id(&self) -> BTreeMap<String, EndpointResult<u64>> {
        self.execute_on_all(|client| async move { client.chain_id().await })
            .await
    }

    pub async fn call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> BTreeMap<String, EndpointResult<serde_json::Value>> {
        self.execute_on_all(|client| {
            let params = params.clone();
            let method = method.to_string();
            async move { client.call(&method, params).await }
        })
        .await
    }

    /// Deploys the contract on every endpoint; addresses differ per chain.
    pub async fn deploy_contract(
        &self,
        params: &DeployContractParams,
        token: &CancellationToken,
    ) -> BTreeMap<String, EndpointResult<DeployedContract>> {
        self.execute_on_all(|client| {
            let params = params.clone();
            let token = token.clone();
            async move { client.deploy_contract(&params, &token).await }
        })
        .await
    }

    pub async fn tx_contract(&self, call: &ContractCall) -> BTreeMap<String, EndpointResult<H256>> {
        self.execute_on_all(|client| {
            let call = call.clone();
            async move { client.tx_contract(&call).await }
        })
        .await
    }

    pub async fn call_contract(
        &self,
        call: &ContractCall,
    ) -> BTreeMap<String, EndpointResult<Vec<Token>>> {
        self.execute_on_all(|client| {
            let call = call.clone();
            async move { client.call_contract(&call).await }
        })
        .await
    }

    pub fn close(&self) {
        for client in &self.clients {
            client.close();
        }
    }
}

/// Owns the clients of every run and the latency index of every database
/// path. Each is built once, on first use, and shared afterwards.
pub struct ClientRegistry {
    metrics: Arc<MetricsCollector>,
    rpc_factory: Arc<RpcFactory>,
    runs: Mutex<HashMap<String, Arc<OnceCell<Arc<Clients>>>>>,
    indexes: Mutex<HashMap<PathBuf, Arc<OnceCell<Arc<LatencyIndex>>>>>,
}

impl ClientRegistry {
    pub fn new(metrics: Arc<MetricsCollector>, rpc_factory: Arc<RpcFactory>) -> Self {
        Self {
            metrics,
            rpc_factory,
            runs: Mutex::new(HashMap::new()),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The index at `path`, opened on first request.
    pub async fn latency_index(&self, path: &Path) -> Result<Arc<LatencyIndex>> {
        let cell = self
            .indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_default()
            .clone();

        let index = cell
            .get_or_try_init(|| async {
                let index = LatencyIndex::open(path, AsyncDbConfig::default())
                    .await
                    .with_context(|| format!("Failed to open latency index {}", path.display()))?;
                anyhow::Ok(Arc::new(index))
            })
            .await?;
        Ok(index.clone())
    }

    /// Clients of `run_uid`, connected on first request. Later calls with the
    /// same run id reuse them and ignore `config`.
    pub async fn clients(
        &self,
        run_uid: &str,
        config: &LoadTestConfig,
        token: &CancellationToken,
    ) -> Result<Arc<Clients>> {
        let cell = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(run_uid.to_string())
            .or_default()
            .clone();

        let clients = cell
            .get_or_try_init(|| async {
                let mut latencies = Vec::with_capacity(config.endpoints.len());
                for endpoint in &config.endpoints {
                    latencies.push(Some(self.latency_index(&endpoint.db_path).await?));
                }
                let clients = Clients::connect(
                    config,
                    run_uid,
                    self.metrics.clone(),
                    &latencies,
                    self.rpc_factory.as_ref(),
                    token,
                )
                .await?;
                anyhow::Ok(Arc::new(clients))
            })
            .await?;
        Ok(clients.clone())
    }

    pub fn get(&self, run_uid: &str) -> Option<Arc<Clients>> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_uid)
            .and_then(|cell| cell.get().cloned())
    }

    /// Closes every client and flushes every latency index.
    pub async fn shutdown(&self) {
        let runs: Vec<_> = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, cell) in runs {
            if let Some(clients) = cell.get() {
                clients.close();
            }
        }

        let indexes: Vec<_> = self
            .indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (path, cell) in indexes {
            if let Some(index) = cell.get() {
                if let Err(e) = index.shutdown().await {
                    warn!(path = %path.display(), "Latency index shutdown failed: {}", e);
                }
            }
        }
    }
}
