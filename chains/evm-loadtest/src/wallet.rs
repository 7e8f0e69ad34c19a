use anyhow::{Context, Result};
use core_logic::{DispatchError, NetworkError, WalletError};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{MutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::PrivateKey;
use crate::rpc::ChainRpc;

/// Bound on concurrent key generation and nonce bootstrap.
pub const MAX_CONCURRENT_SETUP: usize = 500;
pub const WALLETS_TIMEOUT: Duration = Duration::from_secs(600);

/// Per-identity sequence numbers.
///
/// `offset_nonce >= nonce` holds after every mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceState {
    pub nonce: u64,
    pub offset_nonce: u64,
}

impl NonceState {
    pub fn new(nonce: u64) -> Self {
        Self {
            nonce,
            offset_nonce: nonce,
        }
    }

    /// Hands out the next sequence number.
    ///
    /// With `offset == 0` this is `nonce`, and both counters advance. With an
    /// offset the pipelined counter is used instead; the first time it is not
    /// ahead of `nonce` it jumps to `nonce + offset`.
    pub fn assign(&mut self, offset: u64) -> u64 {
        if offset == 0 {
            let assigned = self.nonce;
            self.nonce += 1;
            self.offset_nonce = self.offset_nonce.max(assigned) + 1;
            return assigned;
        }

        if self.offset_nonce <= self.nonce {
            self.offset_nonce = self.nonce + offset;
        }
        let assigned = self.offset_nonce;
        self.offset_nonce += 1;
        assigned
    }

    /// Gives back `assigned` when nothing was handed out after it.
    pub fn rollback(&mut self, assigned: u64) -> bool {
        if self.nonce == assigned + 1 && self.offset_nonce == assigned + 1 {
            self.nonce = assigned;
            self.offset_nonce = assigned;
            return true;
        }
        // Pipelined slot; `nonce` never moved for it.
        if assigned > self.nonce && self.offset_nonce == assigned + 1 {
            self.offset_nonce = assigned;
            return true;
        }
        false
    }
}

/// A signing key plus its nonce state.
pub struct Identity {
    address: Address,
    signer: LocalWallet,
    state: tokio::sync::Mutex<NonceState>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn new(signer: LocalWallet, nonce: u64) -> Self {
        Self {
            address: signer.address(),
            signer,
            state: tokio::sync::Mutex::new(NonceState::new(nonce)),
        }
    }

    pub fn random() -> Self {
        Self::new(LocalWallet::new(&mut rand::thread_rng()), 0)
    }

    /// Parses a 32-byte hex key, with or without `0x`.
    pub fn from_private_key(key: &str, nonce: u64) -> Result<Self, WalletError> {
        let trimmed = key.trim();
        let hex_key = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if hex_key.len() != 64 {
            return Err(WalletError::InvalidKeyLength {
                length: hex_key.len(),
            });
        }

        let bytes = Zeroizing::new(hex::decode(hex_key).map_err(|_| WalletError::InvalidKeyFormat)?);
        let signer =
            LocalWallet::from_bytes(bytes.as_slice()).map_err(|_| WalletError::InvalidKeyFormat)?;
        Ok(Self::new(signer, nonce))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Locks the nonce state. Held across nonce, fee, sign and submit.
    pub async fn lock_nonces(&self) -> MutexGuard<'_, NonceState> {
        self.state.lock().await
    }

    pub async fn nonce_state(&self) -> NonceState {
        *self.state.lock().await
    }

    /// Signs `tx` and returns the raw envelope with its hash.
    ///
    /// The transaction must carry its chain id.
    pub fn sign(&self, tx: &TypedTransaction) -> Result<(Bytes, H256), DispatchError> {
        let signature = self
            .signer
            .sign_transaction_sync(tx)
            .map_err(|e| DispatchError::Signing {
                reason: e.to_string(),
            })?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(ethers::utils::keccak256(&raw));
        Ok((raw, hash))
    }

    /// Resets both counters to the node's pending nonce.
    pub async fn resync(&self, rpc: &dyn ChainRpc) -> Result<u64, WalletError> {
        let mut state = self.state.lock().await;
        let nonce = rpc
            .pending_nonce(self.address)
            .await
            .map_err(|e| WalletError::NonceSync {
                address: format!("{:?}", self.address),
                reason: e.to_string(),
            })?;
        *state = NonceState::new(nonce);
        Ok(nonce)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    identities: HashMap<Address, Arc<Identity>>,
    locked: HashMap<Address, bool>,
}

/// Registry of identities with a busy flag each.
#[derive(Debug, Default)]
pub struct IdentityPool {
    inner: Mutex<PoolInner>,
}

/// An identity taken from the pool; unlocked on drop.
#[derive(Debug)]
pub struct IdentityLease {
    pool: Arc<IdentityPool>,
    identity: Arc<Identity>,
}

impl IdentityLease {
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        self.pool.unlock(&self.identity.address());
    }
}

impl IdentityPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds or replaces an identity, unlocked.
    pub fn register(&self, identity: Arc<Identity>) {
        let mut inner = self.inner();
        let address = identity.address();
        inner.identities.insert(address, identity);
        inner.locked.insert(address, false);
    }

    pub fn unregister(&self, address: &Address) -> Option<Arc<Identity>> {
        let mut inner = self.inner();
        inner.locked.remove(address);
        inner.identities.remove(address)
    }

    /// Returns true only when the identity went from unlocked to locked.
    pub fn lock(&self, address: &Address) -> bool {
        self.set_locked(address, true)
    }

    /// Returns true only when the identity went from locked to unlocked.
    pub fn unlock(&self, address: &Address) -> bool {
        self.set_locked(address, false)
    }

    fn set_locked(&self, address: &Address, locked: bool) -> bool {
        let mut inner = self.inner();
        match inner.locked.get_mut(address) {
            Some(flag) if *flag != locked => {
                *flag = locked;
                true
            }
            _ => false,
        }
    }

    /// Takes any unlocked identity and locks it in the same critical section.
    pub fn get_available(&self) -> Option<Arc<Identity>> {
        let mut inner = self.inner();
        let PoolInner { identities, locked } = &mut *inner;
        let (address, flag) = locked.iter_mut().find(|(_, locked)| !**locked)?;
        *flag = true;
        identities.get(address).cloned()
    }

    /// Like [`get_available`](Self::get_available), unlocking on drop.
    pub fn lease(self: &Arc<Self>) -> Option<IdentityLease> {
        self.get_available().map(|identity| IdentityLease {
            pool: self.clone(),
            identity,
        })
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Identity>> {
        self.inner().identities.get(address).cloned()
    }

    pub fn is_locked(&self, address: &Address) -> bool {
        self.inner().locked.get(address).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.inner().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn all(&self) -> Vec<Arc<Identity>> {
        self.inner().identities.values().cloned().collect()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.inner().identities.keys().copied().collect()
    }

    /// Registers `n` fresh keys with nonce 0.
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
                let identity = Identity::random();
                drop(permit);
                identity
            });
        }

        while let Some(res) = set.join_next().await {
            self.register(Arc::new(res.context("wallet generation task failed")?));
        }
        debug!(count = n, "Generated wallets");
        Ok(())
    }

    /// Parses `keys` and seeds every identity from its pending nonce.
    pub async fn from_private_keys(
        keys: &[PrivateKey],
        rpc: Arc<dyn ChainRpc>,
        token: &CancellationToken,
    ) -> Result<Self> {
        let identities = keys
            .iter()
            .map(|key| Identity::from_private_key(key.expose(), 0).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let pool = Self::new();
        let bootstrap = async {
            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_SETUP));
            let mut set = JoinSet::new();

            for identity in identities {
                let permit = semaphore.clone().acquire_owned().await?;
                let rpc = rpc.clone();
                set.spawn(async move {
                    let res = identity.resync(rpc.as_ref()).await;
                    drop(permit);
                    res.map(|_| identity)
                });
            }

            while let Some(res) = set.join_next().await {
                let identity = res.context("nonce bootstrap task failed")??;
                pool.register(identity);
            }
            anyhow::Ok(())
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DispatchError::Canceled.into()),
            res = tokio::time::timeout(WALLETS_TIMEOUT, bootstrap) => {
                res.map_err(|_| NetworkError::Timeout {
                    timeout_ms: WALLETS_TIMEOUT.as_millis() as u64,
                    endpoint: rpc.endpoint().to_string(),
                })??;
            }
        }

        Ok(pool)
    }
}

/// Identities reserved for callers that pin them across requests.
#[derive(Debug, Default)]
pub struct SharedWallets {
    reserved: Mutex<HashMap<Address, Arc<Identity>>>,
}

impl SharedWallets {
    pub fn new() -> Self {
        Self::default()
    }

    fn reserved(&self) -> std::sync::MutexGuard<'_, HashMap<Address, Arc<Identity>>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks an available identity in `pool` and reserves it.
    pub fn reserve(&self, pool: &IdentityPool) -> Option<Address> {
        let identity = pool.get_available()?;
        let address = identity.address();
        self.reserved().insert(address, identity);
        Some(address)
    }

    /// Unreserves `address` and unlocks it in `pool`.
    pub fn release(&self, pool: &IdentityPool, address: &Address) -> bool {
        if self.reserved().remove(address).is_none() {
            return false;
        }
        pool.unlock(address);
        true
    }

    pub fn get(&self, address: &Address) -> Option<Arc<Identity>> {
        self.reserved().get(address).cloned()
    }

    /// First of `addresses` that is reserved here.
    pub fn find(&self, addresses: &[Address]) -> Option<Arc<Identity>> {
        let reserved = self.reserved();
        addresses.iter().find_map(|a| reserved.get(a).cloned())
    }

    pub fn count(&self) -> usize {
        self.reserved().len()
    }
}
