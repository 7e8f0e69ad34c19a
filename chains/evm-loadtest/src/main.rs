use evm_loadtest::clients::{ClientRegistry, RpcFactory};
use evm_loadtest::config::{EndpointConfig, LoadTestConfig};
use evm_loadtest::dispatcher::{TxKind, TxOptions};
use evm_loadtest::rpc::{ChainRpc, EthersRpc};
use evm_loadtest::utils::confirm::DEFAULT_CONFIRMATION_TIMEOUT;
use evm_loadtest::worker::{BlockReportWorker, LoadWorker, PoolStatusWorker};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use core_logic::metrics::MetricsCollector;
use core_logic::{setup_logger, Worker, WorkerRunner};
use dotenv::dotenv;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario {
    Transfer,
    Erc20,
    Erc721,
}

impl From<Scenario> for TxKind {
    fn from(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Transfer => TxKind::Transfer,
            Scenario::Erc20 => TxKind::Erc20Transfer,
            Scenario::Erc721 => TxKind::Erc721Mint,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "chains/evm-loadtest/config.toml")]
    config: String,
    /// Groups the clients and metrics of this run; random when unset
    #[arg(long)]
    run_id: Option<String>,
    #[arg(short, long, value_enum, default_value = "transfer")]
    scenario: Scenario,
    #[arg(short, long, default_value = "10")]
    workers: usize,
    /// Transactions per request
    #[arg(long, default_value = "100")]
    tx_count: u64,
    #[arg(long, default_value = "0")]
    offset_nonce: u64,
    /// Gas price multiplier
    #[arg(long, default_value = "1")]
    multiplier: u64,
    #[arg(long)]
    dry_run: bool,
    /// Wait for every transaction to be mined
    #[arg(long)]
    confirm: bool,
    /// Seconds to run; until Ctrl+C when unset
    #[arg(short, long)]
    duration: Option<u64>,
    #[arg(long, default_value = "75")]
    report_interval_ms: u64,
    /// Pin one shared wallet per endpoint to each worker
    #[arg(long)]
    shared_wallet: bool,
    #[arg(short, long)]
    export_metrics: Option<String>,
}

fn random_run_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

fn connect_rpc(endpoint: &EndpointConfig) -> Result<Arc<dyn ChainRpc>> {
    let rpc = EthersRpc::connect(&endpoint.http)?;
    Ok(Arc::new(rpc))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Keep guard alive for file logging
    let _log_guard = setup_logger();
    dotenv().ok();

    let args = Args::parse();
    info!("Loading config from: {}", args.config);

    let config = LoadTestConfig::load(&args.config)
        .with_context(|| format!("Invalid config {}", args.config))?;
    info!("Configuration loaded for {} endpoint(s)", config.endpoints.len());

    let opts = TxOptions {
        wait_for_confirmation: args.confirm,
        confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        dry_run: args.dry_run,
        offset_nonce: args.offset_nonce,
        tx_count: args.tx_count,
        gas_price_multiplier: args.multiplier,
        pinned: Vec::new(),
    };
    opts.validate()?;

    let run_id = args.run_id.clone().unwrap_or_else(random_run_id);
    let metrics = Arc::new(MetricsCollector::default());
    let factory: Arc<RpcFactory> = Arc::new(connect_rpc);
    let registry = ClientRegistry::new(metrics.clone(), factory);
    let token = CancellationToken::new();

    info!("Preparing run {}", run_id);
    let clients = match registry.clients(&run_id, &config, &token).await {
        Ok(clients) => clients,
        Err(e) => {
            error!("Setup failed: {:?}", e);
            registry.shutdown().await;
            return Err(e);
        }
    };

    let kind = TxKind::from(args.scenario);
    let mut workers: Vec<Box<dyn Worker>> = Vec::with_capacity(args.workers + 2);
    for id in 1..=args.workers {
        let worker = LoadWorker::new(id, clients.clone(), kind, opts.clone())
            .with_shared_wallet(args.shared_wallet);
        workers.push(Box::new(worker));
    }
    workers.push(Box::new(BlockReportWorker::new(
        clients.clone(),
        Duration::from_millis(args.report_interval_ms.max(1)),
    )));
    workers.push(Box::new(PoolStatusWorker::new(clients.clone())));

    let timer = args.duration.map(|secs| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    info!("Run duration of {}s reached", secs);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    });

    let result = WorkerRunner::run_workers(workers, token.clone()).await;
    token.cancel();
    if let Some(timer) = timer {
        timer.abort();
    }

    if let Some(metrics_path) = &args.export_metrics {
        match metrics.export_to_file(metrics_path).await {
            Ok(_) => info!("Final metrics exported to {}", metrics_path),
            Err(e) => error!("Failed to export final metrics: {}", e),
        }
    }

    registry.shutdown().await;
    result?;
    Ok(())
}
