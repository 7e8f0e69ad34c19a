use anyhow::{Context, Result};
use core_logic::{repeat_with_timeout, DispatchError, PollConfig};
use ethers::types::{Address, H256, U256};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chain::{ChainContext, SetupCall};
use crate::contracts::{batch_send_calldata, deploy_or_attach, ContractKind};
use crate::utils::confirm::wait_until_mined;
use crate::wallet::{IdentityLease, IdentityPool, WALLETS_TIMEOUT};

pub const FUNDING_BATCH_SIZE: usize = 700;
pub const SPONSOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const FUNDING_CONFIRM_INTERVAL: Duration = Duration::from_secs(1);

/// Waits for a free sponsor, polling until the wallets deadline.
pub async fn acquire_sponsor(
    sponsors: &Arc<IdentityPool>,
    token: &CancellationToken,
) -> Result<IdentityLease, DispatchError> {
    repeat_with_timeout(
        token,
        PollConfig::new(WALLETS_TIMEOUT, SPONSOR_POLL_INTERVAL),
        || async { sponsors.lease().ok_or(DispatchError::NoAvailableIdentity) },
    )
    .await
    .map_err(DispatchError::from)
}

/// Deployed `BatchFunder` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchFunder {
    address: Address,
}

impl BatchFunder {
    pub fn at(address: Address) -> Self {
        Self { address }
    }

    pub async fn deploy(
        chain: &ChainContext,
        sponsors: &Arc<IdentityPool>,
        artifacts_dir: &Path,
        token: &CancellationToken,
    ) -> Result<Self> {
        let address = deploy_or_attach(
            chain,
            sponsors,
            ContractKind::BatchFunder,
            None,
            artifacts_dir,
            token,
        )
        .await?;
        Ok(Self::at(address))
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FundingReport {
    pub batches: usize,
    pub recipients: usize,
    pub tx_hashes: Vec<H256>,
}

/// Spreads native currency from the sponsors to many recipients through
/// `batchSend`.
#[derive(Debug, Clone)]
pub struct FundingOrchestrator {
    chain: ChainContext,
    funder: BatchFunder,
    sponsors: Arc<IdentityPool>,
}

impl FundingOrchestrator {
    pub fn new(chain: ChainContext, funder: BatchFunder, sponsors: Arc<IdentityPool>) -> Self {
        Self {
            chain,
            funder,
            sponsors,
        }
    }

    /// Sends `amount` to every recipient, one `batchSend` per 700 of them.
    ///
    /// Succeeds only once every batch is mined successfully; the first failure
    /// cancels whatever is still outstanding.
    pub async fn fund(
        &self,
        recipients: &[Address],
        amount: U256,
        token: &CancellationToken,
    ) -> Result<FundingReport> {
        if recipients.is_empty() {
            return Ok(FundingReport::default());
        }

        let started = Instant::now();
        let run_token = token.child_token();
        let semaphore = Arc::new(Semaphore::new(self.sponsors.count().max(1)));
        let mut set = JoinSet::new();
        let mut batches = 0;

        for batch in recipients.chunks(FUNDING_BATCH_SIZE) {
            let permit = tokio::select! {
                biased;
                _ = run_token.cancelled() => return Err(DispatchError::Canceled.into()),
                permit = semaphore.clone().acquire_owned() => permit?,
            };

            while let Some(res) = set.try_join_next() {
                if let Err(e) = res.context("funding task failed")? {
                    run_token.cancel();
                    return Err(e);
                }
            }

            let this = self.clone();
            let batch = batch.to_vec();
            let task_token = run_token.clone();
            batches += 1;
            set.spawn(async move {
                let hash = this.submit_batch(batch, amount, &task_token).await;
                drop(permit);
                let hash = hash?;

                wait_until_mined(
                    this.chain.rpc().as_ref(),
                    hash,
                    PollConfig::new(WALLETS_TIMEOUT, FUNDING_CONFIRM_INTERVAL),
                    &task_token,
                )
                .await
                .with_context(|| format!("Funding transaction {:?} failed", hash))?;
                anyhow::Ok(hash)
            });
        }

        let mut tx_hashes = Vec::with_capacity(batches);
        while let Some(res) = set.join_next().await {
            match res.context("funding task failed")? {
                Ok(hash) => tx_hashes.push(hash),
                Err(e) => {
                    run_token.cancel();
                    return Err(e);
                }
            }
        }

        info!(
            recipients = recipients.len(),
            batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Funded wallets"
        );

        Ok(FundingReport {
            batches,
            recipients: recipients.len(),
            tx_hashes,
        })
    }

    async fn submit_batch(
        &self,
        batch: Vec<Address>,
        amount: U256,
        token: &CancellationToken,
    ) -> Result<H256> {
        let sponsor = acquire_sponsor(&self.sponsors, token).await?;
        let value = amount
            .checked_mul(U256::from(batch.len()))
            .context("funding value overflows uint256")?;
        let count = batch.len();

        let hash = self
            .chain
            .submit(
                sponsor.identity(),
                SetupCall {
                    to: Some(self.funder.address()),
                    value,
                    data: batch_send_calldata(batch, amount),
                },
            )
            .await?;

        debug!(
            sponsor = ?sponsor.identity().address(),
            recipients = count,
            tx = ?hash,
            "Submitted funding batch"
        );
        Ok(hash)
    }
}
