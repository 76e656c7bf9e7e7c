mod calculator;
mod tracker;

pub use calculator::{
    first_invoke_contract_id, resource_fee_of, FeeCalculator,
    NON_SOROBAN_FEE,
};
pub use tracker::{FeeTracker, UsageInfo};
