mod common;

use common::{context, identity_at, FakeRpc};
use core_logic::DispatchError;
use ethers::types::{Address, U256};
use evm_loadtest::funder::{BatchFunder, FundingOrchestrator, FUNDING_BATCH_SIZE};
use evm_loadtest::wallet::IdentityPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn one_ether() -> U256 {
    U256::exp10(18)
}

fn recipients(n: usize) -> Vec<Address> {
    (0..n).map(|_| Address::random()).collect()
}

fn orchestrator(rpc: &Arc<FakeRpc>, sponsors: usize) -> (FundingOrchestrator, BatchFunder) {
    let pool = Arc::new(IdentityPool::new());
    for _ in 0..sponsors {
        pool.register(identity_at(rpc, 0));
    }
    let funder = BatchFunder::at(Address::repeat_byte(0xfe));
    (FundingOrchestrator::new(context(rpc), funder, pool), funder)
}

#[tokio::test]
async fn test_funds_every_recipient() {
    let rpc = FakeRpc::new();
    let (orchestrator, funder) = orchestrator(&rpc, 1);
    let wallets = recipients(5);

    let report = orchestrator
        .fund(&wallets, one_ether(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.batches, 1);
    assert_eq!(report.recipients, 5);
    for wallet in &wallets {
        assert_eq!(rpc.balance_of(*wallet), one_ether());
    }

    let sent = rpc.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].tx.to_addr(), Some(&funder.address()));
    assert_eq!(sent[0].tx.value(), Some(&(one_ether() * 5)));
}

#[tokio::test]
async fn test_large_funding_is_split_into_batches() {
    let rpc = FakeRpc::new();
    let (orchestrator, _) = orchestrator(&rpc, 2);
    let wallets = recipients(FUNDING_BATCH_SIZE * 2 + 100);
    let amount = U256::from(1_000u64);

    let report = orchestrator
        .fund(&wallets, amount, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.batches, 3);
    assert_eq!(report.tx_hashes.len(), 3);

    let mut values: Vec<U256> = rpc.sent().iter().filter_map(|s| s.tx.value().copied()).collect();
    values.sort();
    assert_eq!(
        values,
        vec![amount * 100, amount * FUNDING_BATCH_SIZE, amount * FUNDING_BATCH_SIZE]
    );
    assert!(wallets.iter().all(|w| rpc.balance_of(*w) == amount));
}

#[tokio::test]
async fn test_no_recipients_is_a_noop() {
    let rpc = FakeRpc::new();
    let (orchestrator, _) = orchestrator(&rpc, 1);

    let report = orchestrator
        .fund(&[], one_ether(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.batches, 0);
    assert!(rpc.sent().is_empty());
}

#[tokio::test]
async fn test_failed_batch_fails_funding() {
    let rpc = FakeRpc::new();
    let (orchestrator, _) = orchestrator(&rpc, 1);
    rpc.push_send_error("insufficient funds for gas * price + value");

    let result = orchestrator
        .fund(&recipients(3), one_ether(), &CancellationToken::new())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_waiting_for_sponsor_is_cancellable() {
    let rpc = FakeRpc::new();
    let (orchestrator, _) = orchestrator(&rpc, 0);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = orchestrator
        .fund(&recipients(2), one_ether(), &token)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DispatchError>(),
        Some(DispatchError::Canceled)
    ));
}
