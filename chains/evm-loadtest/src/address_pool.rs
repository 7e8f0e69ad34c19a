use anyhow::{Context, Result};
use core_logic::DispatchError;
use ethers::types::Address;
use rand::seq::SliceRandom;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::wallet::MAX_CONCURRENT_SETUP;

/// Append-only set of transfer recipients.
#[derive(Debug, Default)]
pub struct AddressPool {
    addresses: RwLock<Vec<Address>>,
}

impl AddressPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the pool with `addresses`, then generates `n` more.
    pub async fn from_config(
        addresses: &[Address],
        n: usize,
        token: &CancellationToken,
    ) -> Result<Self> {
        let pool = Self::new();
        for address in addresses {
            pool.add(*address);
        }
        pool.generate(n, token).await?;
        Ok(pool)
    }

    pub fn add(&self, address: Address) {
        self.addresses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(address);
    }

    pub async fn generate(&self, n: usize, token: &CancellationToken) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SETUP));
        let mut set = JoinSet::new();

        for _ in 0..n {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DispatchError::Canceled.into()),
                permit = semaphore.clone().acquire_owned() => permit?,
            };
            set.spawn(async move {
                let address = Address::from(rand::random::<[u8; 20]>());
                drop(permit);
                address
            });
        }

        while let Some(res) = set.join_next().await {
            self.add(res.context("address generation task failed")?);
        }
        Ok(())
    }

    /// Uniform pick; `None` when empty.
    pub fn random(&self) -> Option<Address> {
        let addresses = self.addresses.read().unwrap_or_else(PoisonError::into_inner);
        addresses.choose(&mut rand::thread_rng()).copied()
    }

    pub fn all(&self) -> Vec<Address> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
