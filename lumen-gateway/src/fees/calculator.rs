use std::collections::HashSet;

use stellar_xdr::curr::{
    HostFunction, OperationBody, ScAddress, TransactionEnvelope,
    TransactionExt,
};

use crate::config::Config;

/// Flat fee assumed for classic (non-Soroban) transactions.
pub const NON_SOROBAN_FEE: i64 = 100_000;

/// Computes the maximum fee the fund account is willing to pay for a
/// fee-bump, aware of Soroban resource fees and of the reduced inclusion
/// tier for limited contracts.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    limited_contracts: HashSet<String>,
    inclusion_fee_default: i64,
    inclusion_fee_limited: i64,
}

impl FeeCalculator {
    pub fn new(
        limited_contracts: HashSet<String>,
        inclusion_fee_default: i64,
        inclusion_fee_limited: i64,
    ) -> Self {
        Self {
            limited_contracts,
            inclusion_fee_default,
            inclusion_fee_limited,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.limited_contracts.clone(),
            config.inclusion_fee_default,
            config.inclusion_fee_limited,
        )
    }

    pub fn is_limited(&self, contract_id: Option<&str>) -> bool {
        contract_id.is_some_and(|id| self.limited_contracts.contains(id))
    }

    pub fn inclusion_fee_for(&self, contract_id: Option<&str>) -> i64 {
        if self.is_limited(contract_id) {
            self.inclusion_fee_limited
        } else {
            self.inclusion_fee_default
        }
    }

    pub fn inclusion_fee_limited(&self) -> i64 {
        self.inclusion_fee_limited
    }

    /// `max_fee = (resource_fee > 0 ? resource_fee : NON_SOROBAN_FEE)
    ///  + inclusion_fee`, computed in wide integers and clamped at the
    /// platform edge.
    pub fn max_fee(&self, envelope: &TransactionEnvelope) -> i64 {
        let resource_fee = resource_fee_of(envelope) as i128;
        let contract_id = first_invoke_contract_id(envelope);
        let inclusion =
            self.inclusion_fee_for(contract_id.as_deref()) as i128;

        let base = if resource_fee > 0 {
            resource_fee
        } else {
            NON_SOROBAN_FEE as i128
        };
        (base + inclusion).min(i64::MAX as i128) as i64
    }
}

/// The declared Soroban resource fee of an envelope, `0` when the
/// transaction carries no Soroban data. Fee-bump envelopes answer for
/// their inner transaction.
pub fn resource_fee_of(envelope: &TransactionEnvelope) -> i64 {
    match envelope {
        TransactionEnvelope::Tx(env) => match &env.tx.ext {
            TransactionExt::V1(soroban_data) => soroban_data.resource_fee,
            _ => 0,
        },
        TransactionEnvelope::TxFeeBump(env) => {
            let stellar_xdr::curr::FeeBumpTransactionInnerTx::Tx(inner) =
                &env.tx.inner_tx;
            match &inner.tx.ext {
                TransactionExt::V1(soroban_data) => {
                    soroban_data.resource_fee
                }
                _ => 0,
            }
        }
        TransactionEnvelope::TxV0(_) => 0,
    }
}

/// Contract id (`C...`) of the first invoke-host-function operation.
/// Malformed or non-contract envelopes yield `None`, which lands on the
/// default inclusion tier.
pub fn first_invoke_contract_id(
    envelope: &TransactionEnvelope,
) -> Option<String> {
    let operations = match envelope {
        TransactionEnvelope::Tx(env) => env.tx.operations.as_slice(),
        TransactionEnvelope::TxFeeBump(env) => {
            let stellar_xdr::curr::FeeBumpTransactionInnerTx::Tx(inner) =
                &env.tx.inner_tx;
            inner.tx.operations.as_slice()
        }
        TransactionEnvelope::TxV0(env) => env.tx.operations.as_slice(),
    };

    operations.iter().find_map(|op| match &op.body {
        OperationBody::InvokeHostFunction(invoke) => {
            match &invoke.host_function {
                HostFunction::InvokeContract(args) => {
                    match &args.contract_address {
                        ScAddress::Contract(contract_id) => Some(
                            stellar_strkey::Contract(contract_id.0 .0)
                                .to_string(),
                        ),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        build_envelope, contract_address, host_function, CONTRACT_SEED,
    };

    fn calculator_with(limited: &[String]) -> FeeCalculator {
        FeeCalculator::new(limited.iter().cloned().collect(), 203, 201)
    }

    fn limited_contract_id() -> String {
        stellar_strkey::Contract([CONTRACT_SEED; 32]).to_string()
    }

    #[test]
    fn soroban_fee_is_resource_plus_inclusion() {
        let envelope = build_envelope(Some(58_181), true);
        let calc = calculator_with(&[]);
        assert_eq!(calc.max_fee(&envelope), 58_181 + 203);
    }

    #[test]
    fn limited_contract_uses_reduced_inclusion() {
        let envelope = build_envelope(Some(58_181), true);
        let calc = calculator_with(&[limited_contract_id()]);
        assert_eq!(calc.max_fee(&envelope), 58_181 + 201);
    }

    #[test]
    fn non_soroban_fee_uses_flat_base() {
        let envelope = build_envelope(None, false);
        let calc = calculator_with(&[]);
        assert_eq!(calc.max_fee(&envelope), NON_SOROBAN_FEE + 203);
    }

    #[test]
    fn zero_resource_fee_counts_as_non_soroban() {
        let envelope = build_envelope(Some(0), true);
        let calc = calculator_with(&[]);
        assert_eq!(calc.max_fee(&envelope), NON_SOROBAN_FEE + 203);
    }

    #[test]
    fn contract_id_extraction_finds_first_invoke() {
        let envelope = build_envelope(Some(10), true);
        assert_eq!(
            first_invoke_contract_id(&envelope),
            Some(limited_contract_id())
        );
    }

    #[test]
    fn non_invoke_envelope_has_no_contract_id() {
        let envelope = build_envelope(None, false);
        assert_eq!(first_invoke_contract_id(&envelope), None);
    }

    #[test]
    fn host_function_fixture_targets_expected_contract() {
        let HostFunction::InvokeContract(args) = host_function() else {
            panic!("fixture must be an invoke");
        };
        assert_eq!(args.contract_address, contract_address());
    }
}
