pub mod confirm;
pub mod gas;
pub mod shared_counter;

pub use confirm::{wait_until_mined, TxInfo};
pub use gas::{build_transaction, FeeParams, GasLimits};
pub use shared_counter::SharedCounter;
