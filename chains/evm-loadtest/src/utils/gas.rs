use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use serde::Deserialize;

/// Gas limit of a plain value transfer.
pub const LIMIT_TRANSFER: U256 = U256([21_000, 0, 0, 0]);

/// Per-call gas limits for the load transactions.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GasLimits {
    #[serde(default = "default_erc20_transfer")]
    pub erc20_transfer: u64,
    #[serde(default = "default_erc721_mint")]
    pub erc721_mint: u64,
}

impl Default for GasLimits {
    fn default() -> Self {
        Self {
            erc20_transfer: default_erc20_transfer(),
            erc721_mint: default_erc721_mint(),
        }
    }
}

fn default_erc20_transfer() -> u64 {
    100_000
}

fn default_erc721_mint() -> u64 {
    200_000
}

/// Fee fields for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeParams {
    Legacy {
        gas_price: U256,
    },
    Dynamic {
        max_priority_fee: U256,
        max_fee: U256,
    },
}

/// `gasPrice = latest * multiplier`
pub fn legacy_fees(latest_gas_price: U256, multiplier: u64) -> FeeParams {
    FeeParams::Legacy {
        gas_price: latest_gas_price.saturating_mul(U256::from(multiplier)),
    }
}

/// `tip = latestTip * multiplier`, `cap = tip + 2 * baseFee`
pub fn dynamic_fees(latest_tip: U256, base_fee: U256, multiplier: u64) -> FeeParams {
    let tip = latest_tip.saturating_mul(U256::from(multiplier));
    let max_fee = tip.saturating_add(base_fee.saturating_mul(U256::from(2)));
    FeeParams::Dynamic {
        max_priority_fee: tip,
        max_fee,
    }
}

/// Nodes that answer 0 get the configured floor instead.
pub fn floor_suggestion(suggested: U256, min: U256) -> U256 {
    if suggested.is_zero() {
        min
    } else {
        suggested
    }
}

/// Everything needed to build an unsigned transaction.
#[derive(Debug, Clone)]
pub struct TxFields {
    pub from: Address,
    /// `None` deploys `data` as init code.
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    /// Left unset for gas estimation.
    pub gas: Option<U256>,
    pub nonce: u64,
    pub chain_id: u64,
}

pub fn build_transaction(fees: FeeParams, fields: TxFields) -> TypedTransaction {
    match fees {
        FeeParams::Legacy { gas_price } => {
            let mut req = TransactionRequest::new()
                .from(fields.from)
                .value(fields.value)
                .data(fields.data)
                .gas_price(gas_price)
                .nonce(fields.nonce)
                .chain_id(fields.chain_id);
            if let Some(to) = fields.to {
                req = req.to(to);
            }
            if let Some(gas) = fields.gas {
                req = req.gas(gas);
            }
            req.into()
        }
        FeeParams::Dynamic {
            max_priority_fee,
            max_fee,
        } => {
            let mut req = Eip1559TransactionRequest::new()
                .from(fields.from)
                .value(fields.value)
                .data(fields.data)
                .max_priority_fee_per_gas(max_priority_fee)
                .max_fee_per_gas(max_fee)
                .nonce(fields.nonce)
                .chain_id(fields.chain_id);
            if let Some(to) = fields.to {
                req = req.to(to);
            }
            if let Some(gas) = fields.gas {
                req = req.gas(gas);
            }
            req.into()
        }
    }
}
