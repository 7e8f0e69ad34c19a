//! # Core Error Types
//!
//! Centralized error definitions shared by the load-test crates.
//! All errors implement `std::error::Error` and `std::fmt::Display`.

use thiserror::Error;

/// Unified error type for core-logic operations.
///
/// Wraps the specific error types so the application layer can carry a
/// single error value across module boundaries.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error(transparent)]
    Wallet(WalletError),

    #[error(transparent)]
    Network(NetworkError),

    #[error(transparent)]
    Dispatch(DispatchError),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<DatabaseError> for CoreError {
    fn from(e: DatabaseError) -> Self {
        CoreError::Database(e)
    }
}

impl From<WalletError> for CoreError {
    fn from(e: WalletError) -> Self {
        CoreError::Wallet(e)
    }
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        CoreError::Network(e)
    }
}

impl From<DispatchError> for CoreError {
    fn from(e: DispatchError) -> Self {
        CoreError::Dispatch(e)
    }
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid RPC URL format: '{url}'")]
    InvalidRpcUrl { url: String },

    #[error("Invalid RPC URL scheme '{scheme}': expected http or https")]
    InvalidScheme { scheme: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },
}

/// Wallet and key handling errors
#[derive(Error, Debug, Clone)]
pub enum WalletError {
    #[error("Wallet {address} is not registered")]
    NotFound { address: String },

    #[error("Invalid private key format: expected hex string")]
    InvalidKeyFormat,

    #[error("Private key too short: expected 64 hex chars, got {length}")]
    InvalidKeyLength { length: usize },

    #[error("Failed to sync nonce for {address}: {reason}")]
    NonceSync { address: String, reason: String },
}

/// Database operation errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection pool exhausted (max: {max_size})")]
    PoolExhausted { max_size: u32 },

    #[error("Transaction failed: {msg}")]
    TransactionFailed { msg: String },

    #[error("Failed to archive previous database {path}: {msg}")]
    ArchiveFailed { path: String, msg: String },

    #[error("Corrupt latency entry for key {key}")]
    CorruptEntry { key: String },
}

/// Network and RPC-related errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("RPC request timeout after {timeout_ms}ms to {endpoint}")]
    Timeout { timeout_ms: u64, endpoint: String },

    #[error("Connection refused to {endpoint}: {reason}")]
    ConnectionRefused { endpoint: String, reason: String },

    #[error("RPC {method} failed: {message}")]
    Rpc { method: String, message: String },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Node at {endpoint} is syncing")]
    Syncing { endpoint: String },
}

impl NetworkError {
    pub fn rpc(method: &str, err: impl std::fmt::Display) -> Self {
        NetworkError::Rpc {
            method: method.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors surfaced by the transaction send pipeline.
///
/// `Canceled` and `DeadlineExceeded` are kept apart from business failures so
/// callers can tell a shutdown from a slow chain.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("no available wallet")]
    NoAvailableIdentity,

    #[error("no target address available")]
    EmptyAddressPool,

    #[error("{contract} contract is not initialized")]
    ContractNotInitialized { contract: &'static str },

    #[error("no ABI registered for contract {address}")]
    UnknownContract { address: String },

    #[error("ABI error: {reason}")]
    Abi { reason: String },

    #[error("invalid transaction options: {reason}")]
    InvalidOptions { reason: String },

    #[error("failed to sign transaction: {reason}")]
    Signing { reason: String },

    #[error(transparent)]
    Rpc(#[from] NetworkError),

    #[error("transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("deadline exceeded after {waited_ms}ms: {context}")]
    DeadlineExceeded { waited_ms: u64, context: String },

    #[error("operation canceled")]
    Canceled,

    #[error("failed to send any transaction after {attempts} attempts: {last_error}")]
    NoTransactionSent { attempts: u64, last_error: String },
}

impl DispatchError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, DispatchError::Canceled)
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, DispatchError::DeadlineExceeded { .. })
    }
}
