use anyhow::{Context, Result};
use core_logic::{repeat_with_timeout, DispatchError, NetworkError, PollConfig};
use ethers::abi::{AbiDecode, AbiEncode};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, U256};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chain::{ChainContext, SetupCall};
use crate::funder::acquire_sponsor;
use crate::rpc::ChainRpc;
use crate::utils::confirm::{wait_until_mined, CONFIRMATION_STEP, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::wallet::{Identity, IdentityPool, MAX_CONCURRENT_SETUP};

mod funder_abi {
    ethers::contract::abigen!(
        BatchFunder,
        r#"[
            function batchSend(address[] recipients, uint256 amount) payable
        ]"#
    );
}

mod erc20_abi {
    ethers::contract::abigen!(
        LoadTestERC20,
        r#"[
            function mint(uint256 amount)
            function transfer(address to, uint256 amount) returns (bool)
            function approve(address spender, uint256 amount) returns (bool)
            function balanceOf(address owner) view returns (uint256)
        ]"#
    );
}

mod erc721_abi {
    ethers::contract::abigen!(
        LoadTestERC721,
        r#"[
            function mintBatch(address to, uint256 amount)
            function balanceOf(address owner) view returns (uint256)
            function ownerOf(uint256 tokenId) view returns (address)
        ]"#
    );
}

pub use erc20_abi::{ApproveCall, MintCall, TransferCall};
pub use erc721_abi::{MintBatchCall, OwnerOfCall};
pub use funder_abi::BatchSendCall;

/// Balance reads poll this long before giving up.
const BALANCE_POLL: PollConfig =
    PollConfig::new(Duration::from_secs(3), Duration::from_millis(10));

/// The fixed contracts the engine deploys or attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    BatchFunder,
    Erc20,
    Erc721,
}

impl ContractKind {
    pub fn artifact_name(&self) -> &'static str {
        match self {
            ContractKind::BatchFunder => "BatchFunder",
            ContractKind::Erc20 => "ERC20",
            ContractKind::Erc721 => "ERC721",
        }
    }
}

/// Reads `<dir>/<Name>.bin` as hex init code.
pub fn load_bytecode(artifacts_dir: &Path, kind: ContractKind) -> Result<Bytes> {
    let path = artifacts_dir.join(format!("{}.bin", kind.artifact_name()));
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read contract bytecode {}", path.display()))?;
    let trimmed = content.trim();
    let hex_code = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(hex_code)
        .with_context(|| format!("Invalid hex in contract bytecode {}", path.display()))?;
    Ok(bytes.into())
}

pub fn batch_send_calldata(recipients: Vec<Address>, amount: U256) -> Bytes {
    BatchSendCall { recipients, amount }.encode().into()
}

pub fn erc20_transfer_calldata(to: Address, amount: U256) -> Bytes {
    TransferCall { to, amount }.encode().into()
}

pub fn erc20_mint_calldata(amount: U256) -> Bytes {
    MintCall { amount }.encode().into()
}

pub fn erc20_approve_calldata(spender: Address, amount: U256) -> Bytes {
    ApproveCall { spender, amount }.encode().into()
}

pub fn erc721_mint_batch_calldata(to: Address, amount: U256) -> Bytes {
    MintBatchCall { to, amount }.encode().into()
}

fn view_call(contract: Address, data: Bytes) -> TypedTransaction {
    TransactionRequest::new().to(contract).data(data).into()
}

async fn read_u256(rpc: &dyn ChainRpc, contract: Address, data: Bytes) -> Result<U256, DispatchError> {
    let out = rpc.call(&view_call(contract, data)).await?;
    U256::decode(out.as_ref()).map_err(|e| {
        NetworkError::InvalidResponse {
            endpoint: rpc.endpoint().to_string(),
            reason: format!("bad uint256 return: {}", e),
        }
        .into()
    })
}

pub async fn erc20_balance(
    rpc: &dyn ChainRpc,
    contract: Address,
    owner: Address,
) -> Result<U256, DispatchError> {
    read_u256(rpc, contract, erc20_abi::BalanceOfCall { owner }.encode().into()).await
}

pub async fn erc721_balance(
    rpc: &dyn ChainRpc,
    contract: Address,
    owner: Address,
) -> Result<U256, DispatchError> {
    read_u256(rpc, contract, erc721_abi::BalanceOfCall { owner }.encode().into()).await
}

pub async fn erc721_owner_of(
    rpc: &dyn ChainRpc,
    contract: Address,
    token_id: U256,
) -> Result<Address, DispatchError> {
    let out = rpc
        .call(&view_call(contract, OwnerOfCall { token_id }.encode().into()))
        .await?;
    Address::decode(out.as_ref()).map_err(|e| {
        NetworkError::InvalidResponse {
            endpoint: rpc.endpoint().to_string(),
            reason: format!("bad address return: {}", e),
        }
        .into()
    })
}

/// ERC20 balance, retried briefly while the node catches up.
async fn polled_erc20_balance(
    rpc: &dyn ChainRpc,
    contract: Address,
    owner: Address,
    token: &CancellationToken,
) -> Result<U256, DispatchError> {
    repeat_with_timeout(token, BALANCE_POLL, || erc20_balance(rpc, contract, owner))
        .await
        .map_err(DispatchError::from)
}

/// Attaches to `address` or deploys `kind` from a sponsor.
pub async fn deploy_or_attach(
    chain: &ChainContext,
    sponsors: &Arc<IdentityPool>,
    kind: ContractKind,
    address: Option<Address>,
    artifacts_dir: &Path,
    token: &CancellationToken,
) -> Result<Address> {
    if let Some(address) = address {
        return Ok(address);
    }

    let bytecode = load_bytecode(artifacts_dir, kind)?;
    let sponsor = acquire_sponsor(sponsors, token).await?;
    let address = chain
        .deploy(sponsor.identity(), bytecode, token)
        .await
        .with_context(|| format!("Failed to deploy {}", kind.artifact_name()))?;

    info!(contract = kind.artifact_name(), address = ?address, "Deployed contract");
    Ok(address)
}

/// Tops every tester up to `amount` tokens, then checks the balance.
pub async fn mint_erc20_all(
    chain: &ChainContext,
    testers: &IdentityPool,
    contract: Address,
    amount: U256,
    token: &CancellationToken,
) -> Result<()> {
    if amount.is_zero() {
        return Ok(());
    }

    for_each_tester(chain, testers, token, move |chain, identity, token| async move {
        let rpc = chain.rpc().as_ref();
        let balance = polled_erc20_balance(rpc, contract, identity.address(), &token).await?;
        if balance >= amount {
            return Ok(());
        }

        let hash = chain
            .submit(
                &identity,
                SetupCall {
                    to: Some(contract),
                    value: U256::zero(),
                    data: erc20_mint_calldata(amount - balance),
                },
            )
            .await?;
        wait_until_mined(
            rpc,
            hash,
            PollConfig::new(DEFAULT_CONFIRMATION_TIMEOUT, CONFIRMATION_STEP),
            &token,
        )
        .await?;

        let balance = polled_erc20_balance(rpc, contract, identity.address(), &token).await?;
        if balance < amount {
            anyhow::bail!(
                "ERC20 balance of {:?} is {} after mint, expected at least {}",
                identity.address(),
                balance,
                amount
            );
        }
        anyhow::Ok(())
    })
    .await
}

/// Mints one token to every tester.
pub async fn mint_erc721_all(
    chain: &ChainContext,
    testers: &IdentityPool,
    contract: Address,
    token: &CancellationToken,
) -> Result<()> {
    for_each_tester(chain, testers, token, move |chain, identity, token| async move {
        let hash = chain
            .submit(
                &identity,
                SetupCall {
                    to: Some(contract),
                    value: U256::zero(),
                    data: erc721_mint_batch_calldata(identity.address(), U256::one()),
                },
            )
            .await?;
        wait_until_mined(
            chain.rpc().as_ref(),
            hash,
            PollConfig::new(DEFAULT_CONFIRMATION_TIMEOUT, CONFIRMATION_STEP),
            &token,
        )
        .await?;
        anyhow::Ok(())
    })
    .await
}

/// Runs `job` for every tester, at most [`MAX_CONCURRENT_SETUP`] at once.
/// The first error cancels the rest.
async fn for_each_tester<F, Fut>(
    chain: &ChainContext,
    testers: &IdentityPool,
    token: &CancellationToken,
    job: F,
) -> Result<()>
where
    F: Fn(ChainContext, Arc<Identity>, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let run_token = token.child_token();
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SETUP));
    let mut set = JoinSet::new();

    for identity in testers.all() {
        let permit = tokio::select! {
            biased;
            _ = run_token.cancelled() => return Err(DispatchError::Canceled.into()),
            permit = semaphore.clone().acquire_owned() => permit?,
        };

        while let Some(res) = set.try_join_next() {
            if let Err(e) = res.context("token setup task failed")? {
                run_token.cancel();
                return Err(e);
            }
        }

        let fut = job(chain.clone(), identity, run_token.clone());
        set.spawn(async move {
            let res = fut.await;
            drop(permit);
            res
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res.context("token setup task failed")? {
            run_token.cancel();
            return Err(e);
        }
    }
    Ok(())
}
