//! Calls against arbitrary contracts described by a JSON ABI, addressed by
//! method name with already-typed arguments.

use core_logic::DispatchError;
use ethers::abi::{Abi, Function, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Label used for `req_duration` samples of contract calls.
pub const CONTRACT_CALL: &str = "callContract";

#[derive(Debug, Clone)]
pub struct DeployContractParams {
    pub abi_path: PathBuf,
    /// Hex init code, with or without `0x`.
    pub bin_path: PathBuf,
    pub constructor_args: Vec<Token>,
}

#[derive(Debug, Clone)]
pub struct ContractCall {
    pub address: Address,
    pub method: String,
    pub args: Vec<Token>,
}

impl ContractCall {
    pub fn new(address: Address, method: impl Into<String>, args: Vec<Token>) -> Self {
        Self {
            address,
            method: method.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployedContract {
    pub deployer: Address,
    pub address: Address,
}

fn abi_error(reason: impl std::fmt::Display) -> DispatchError {
    DispatchError::Abi {
        reason: reason.to_string(),
    }
}

pub fn load_abi(path: &Path) -> Result<Abi, DispatchError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| abi_error(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content).map_err(|e| abi_error(format!("parse {}: {}", path.display(), e)))
}

pub fn load_init_code(path: &Path) -> Result<Bytes, DispatchError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| abi_error(format!("read {}: {}", path.display(), e)))?;
    let trimmed = content.trim();
    let code = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .map_err(|e| abi_error(format!("bad hex in {}: {}", path.display(), e)))?;
    Ok(code.into())
}

/// Init code with the ABI-encoded constructor arguments appended.
pub fn deploy_data(abi: &Abi, code: Bytes, args: &[Token]) -> Result<Bytes, DispatchError> {
    match abi.constructor() {
        Some(constructor) => constructor
            .encode_input(code.to_vec(), args)
            .map(Bytes::from)
            .map_err(abi_error),
        None if args.is_empty() => Ok(code),
        None => Err(abi_error("constructor arguments given but the ABI has no constructor")),
    }
}

/// ABIs of the contracts a client deployed or attached to.
#[derive(Debug, Default)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<Address, Arc<Abi>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: Address, abi: Abi) {
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, Arc::new(abi));
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    fn function<'a>(abi: &'a Abi, method: &str) -> Result<&'a Function, DispatchError> {
        abi.function(method).map_err(abi_error)
    }

    fn abi(&self, address: &Address) -> Result<Arc<Abi>, DispatchError> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownContract {
                address: format!("{:?}", address),
            })
    }

    pub fn encode(&self, call: &ContractCall) -> Result<Bytes, DispatchError> {
        let abi = self.abi(&call.address)?;
        Self::function(&abi, &call.method)?
            .encode_input(&call.args)
            .map(Bytes::from)
            .map_err(abi_error)
    }

    pub fn decode_output(&self, call: &ContractCall, output: &[u8]) -> Result<Vec<Token>, DispatchError> {
        let abi = self.abi(&call.address)?;
        Self::function(&abi, &call.method)?
            .decode_output(output)
            .map_err(abi_error)
    }

    /// Read-only `eth_call` for `call`, sent from the contract's own address.
    pub fn view_request(&self, call: &ContractCall) -> Result<TypedTransaction, DispatchError> {
        let data = self.encode(call)?;
        Ok(TransactionRequest::new()
            .from(call.address)
            .to(call.address)
            .data(data)
            .into())
    }
}
