//! # EVM Load Test
//!
//! Drives signed transactions at one or more EVM endpoints and measures how
//! the chain keeps up.
//!
//! - [`config`] - Endpoint file layout and validation
//! - [`rpc`] - [`rpc::ChainRpc`] seam over the node
//! - [`wallet`] - Identities, nonce bookkeeping and the identity pool
//! - [`dispatcher`] - Per-request send loop
//! - [`funder`] - Batch funding of generated wallets
//! - [`contract_calls`] - ABI-driven deploy, transact and call by method name
//! - [`client`] / [`clients`] - Per-endpoint state and the multi-endpoint fan-out
//! - [`worker`] - Load, block report and pool status workers

pub mod address_pool;
pub mod chain;
pub mod client;
pub mod clients;
pub mod config;
pub mod contract_calls;
pub mod contracts;
pub mod dispatcher;
pub mod funder;
pub mod report;
pub mod rpc;
pub mod utils;
pub mod wallet;
pub mod worker;
