use log::*;
use serde_json::json;
use stellar_xdr::curr::{
    DecoratedSignature, HostFunction, InvokeHostFunctionOp, Limits, Memo,
    MuxedAccount, Operation, OperationBody, Preconditions, ReadXdr,
    SequenceNumber, SorobanAuthorizationEntry, SorobanTransactionData,
    TimeBounds, TimePoint, Transaction, TransactionEnvelope, TransactionExt,
    TransactionV1Envelope, Uint256, WriteXdr,
};

use lumen_rpc_client::{AuthMode, ChainRpc, SorobanRpcClientError};

use crate::error::{ErrorCode, GatewayError, GatewayResult};

/// Classic fee carried by probe and inner transactions before the resource
/// fee is applied.
pub const BASE_INNER_FEE: u32 = 100;

/// Seconds of validity given to built transactions, and the ceiling
/// accepted on submitted ones.
pub const TX_VALIDITY_WINDOW_SECS: u64 = 120;

/// One simulation's output, decoded once and reused for the read-only
/// check and for assembly.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub response: lumen_rpc_client::SimulateTransactionResponse,
    pub soroban_data: Option<SorobanTransactionData>,
}

/// Simulates `(func, auth)` once, sourced from the fund account at
/// sequence 0 so no real sequence slot is consumed. Runs with
/// `authMode=enforce`: signature validation happens during simulation and
/// expired or invalid auth entries fail here instead of on chain.
pub async fn simulate_host_function(
    rpc: &dyn ChainRpc,
    fund_address: &str,
    func: &HostFunction,
    auth: &[SorobanAuthorizationEntry],
) -> GatewayResult<Simulation> {
    let tx = build_invoke_tx(fund_address, 0, func, auth, BASE_INNER_FEE)?;
    let envelope_xdr = envelope_to_base64(&unsigned_envelope(tx))?;

    let response = match rpc
        .simulate_transaction(&envelope_xdr, AuthMode::Enforce)
        .await
    {
        Ok(response) => response,
        Err(SorobanRpcClientError::Transport(_, message)) => {
            return Err(GatewayError::new(
                ErrorCode::SimulationNetworkError,
                format!("simulation request failed: {}", message),
            ));
        }
        Err(err) => {
            return Err(GatewayError::new(
                ErrorCode::SimulationRpcFailure,
                format!("simulation RPC failed: {}", err),
            ));
        }
    };

    if let Some(raw_error) = &response.error {
        let haystack = {
            let mut haystack = raw_error.clone();
            for event in &response.events {
                haystack.push('\n');
                haystack.push_str(event);
            }
            haystack
        };
        let code = if is_signed_auth_failure(&haystack) {
            ErrorCode::SimulationSignedAuthValidationFailed
        } else {
            ErrorCode::SimulationFailed
        };
        let message = parse_simulation_error(raw_error);
        debug!("Simulation failed ({}): {}", code.as_str(), message);
        return Err(GatewayError::with_details(
            code,
            message,
            json!({ "error": truncate(raw_error, 100) }),
        ));
    }

    let soroban_data = response
        .transaction_data
        .as_deref()
        .and_then(|data| {
            SorobanTransactionData::from_xdr_base64(data, Limits::none())
                .map_err(|err| {
                    warn!("Cannot decode simulation footprint: {}", err);
                    err
                })
                .ok()
        });

    Ok(Simulation {
        response,
        soroban_data,
    })
}

/// A call is read-only iff the first result carries no authorization
/// entries and the simulated footprint writes nothing. Such calls are
/// answered straight from the simulation; nothing is submitted.
pub fn is_read_only(sim: &Simulation) -> bool {
    let no_auth = sim
        .response
        .results
        .first()
        .map(|result| result.auth.is_empty())
        .unwrap_or(true);
    let empty_read_write = sim
        .soroban_data
        .as_ref()
        .map(|data| data.resources.footprint.read_write.is_empty())
        .unwrap_or(false);
    no_auth && empty_read_write
}

/// Assembles the inner transaction for submission: channel-sourced at its
/// current sequence, carrying the caller's auth entries and the cached
/// simulation's footprint and resource fee.
pub fn assemble(
    channel_address: &str,
    sequence: i64,
    func: &HostFunction,
    auth: &[SorobanAuthorizationEntry],
    sim: &Simulation,
) -> GatewayResult<TransactionEnvelope> {
    let resource_fee: i64 = sim
        .response
        .min_resource_fee
        .as_deref()
        .and_then(|fee| fee.parse().ok())
        .unwrap_or(0);

    let fee = (BASE_INNER_FEE as i64)
        .saturating_add(resource_fee)
        .clamp(0, u32::MAX as i64) as u32;

    let mut tx =
        build_invoke_tx(channel_address, sequence, func, auth, fee)?;

    if let Some(mut soroban_data) = sim.soroban_data.clone() {
        soroban_data.resource_fee = resource_fee;
        tx.ext = TransactionExt::V1(soroban_data);
    }

    Ok(unsigned_envelope(tx))
}

/// Appends a detached signature returned by a channel signer to the
/// envelope.
pub fn append_signature(
    envelope: TransactionEnvelope,
    signature_b64: &str,
) -> GatewayResult<TransactionEnvelope> {
    let signature =
        DecoratedSignature::from_xdr_base64(signature_b64, Limits::none())
            .map_err(|err| {
                GatewayError::new(
                    ErrorCode::InvalidSignature,
                    format!("channel signer returned a bad signature: {}", err),
                )
            })?;

    let TransactionEnvelope::Tx(mut env) = envelope else {
        return Err(GatewayError::new(
            ErrorCode::InvalidSignature,
            "only regular envelopes can be co-signed",
        ));
    };
    let mut signatures = env.signatures.to_vec();
    signatures.push(signature);
    env.signatures = signatures.try_into().map_err(|_| {
        GatewayError::new(
            ErrorCode::InvalidSignature,
            "signature list overflow",
        )
    })?;
    Ok(TransactionEnvelope::Tx(env))
}

pub fn envelope_to_base64(
    envelope: &TransactionEnvelope,
) -> GatewayResult<String> {
    envelope
        .to_xdr_base64(Limits::none())
        .map_err(|err| assembly_error(err.to_string()))
}

fn unsigned_envelope(tx: Transaction) -> TransactionEnvelope {
    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx,
        signatures: Default::default(),
    })
}

fn build_invoke_tx(
    source_address: &str,
    sequence: i64,
    func: &HostFunction,
    auth: &[SorobanAuthorizationEntry],
    fee: u32,
) -> GatewayResult<Transaction> {
    let source = stellar_strkey::ed25519::PublicKey::from_string(
        source_address,
    )
    .map_err(|err| {
        assembly_error(format!(
            "invalid source address '{}': {:?}",
            source_address, err
        ))
    })?;

    let operation = Operation {
        source_account: None,
        body: OperationBody::InvokeHostFunction(InvokeHostFunctionOp {
            host_function: func.clone(),
            auth: auth
                .to_vec()
                .try_into()
                .map_err(|_| assembly_error("too many auth entries"))?,
        }),
    };

    Ok(Transaction {
        source_account: MuxedAccount::Ed25519(Uint256(source.0)),
        fee,
        seq_num: SequenceNumber(sequence),
        cond: Preconditions::Time(TimeBounds {
            min_time: TimePoint(0),
            max_time: TimePoint(now_secs() + TX_VALIDITY_WINDOW_SECS),
        }),
        memo: Memo::None,
        operations: vec![operation]
            .try_into()
            .map_err(|_| assembly_error("operation list overflow"))?,
        ext: TransactionExt::V0,
    })
}

fn assembly_error(message: impl ToString) -> GatewayError {
    GatewayError::new(ErrorCode::AssemblyFailed, message.to_string())
}

// -----------------
// Error-message parsing
// -----------------

/// Extracts a readable message out of a raw simulation error: prefer a
/// bracketed `data:["…"]` payload, then a quoted `data:"…"` payload, then
/// the first non-empty line. The `Error(X, Y)` type tag is appended when
/// present. Captured fragments of three characters or fewer are ignored.
pub fn parse_simulation_error(raw: &str) -> String {
    let message = extract_data_array(raw)
        .or_else(|| extract_data_string(raw))
        .filter(|message| message.trim().len() > 3)
        .unwrap_or_else(|| first_line(raw));

    match extract_error_tag(raw) {
        Some(tag) => format!("{} ({})", message.trim(), tag),
        None => message.trim().to_string(),
    }
}

fn is_signed_auth_failure(haystack: &str) -> bool {
    const MARKERS: &[&str] = &[
        "error(auth",
        "require_auth",
        "invalid signature",
        "signature has expired",
        "signature verification failed",
        "bad_signature",
        "tx_bad_auth",
    ];
    let haystack = haystack.to_lowercase();
    MARKERS.iter().any(|marker| haystack.contains(marker))
}

fn extract_data_array(raw: &str) -> Option<String> {
    let start = raw.find("data:[")?;
    let rest = &raw[start + "data:[".len()..];
    let end = rest.find(']')?;
    extract_quoted(&rest[..end])
}

fn extract_data_string(raw: &str) -> Option<String> {
    let start = raw.find("data:\"")?;
    let rest = &raw[start + "data:\"".len()..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn extract_quoted(fragment: &str) -> Option<String> {
    let open = fragment.find('"')?;
    let rest = &fragment[open + 1..];
    let close = rest.find('"')?;
    Some(rest[..close].to_string())
}

/// The `X, Y` inside the first `Error(X, Y)` occurrence.
fn extract_error_tag(raw: &str) -> Option<String> {
    let start = raw.find("Error(")?;
    let rest = &raw[start + "Error(".len()..];
    let end = rest.find(')')?;
    let tag = rest[..end].trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

fn first_line(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("simulation failed")
        .to_string()
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        raw.chars().take(max).collect()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        auth_entry, fund_address, host_function, simulate_response_ok,
        soroban_data_b64, StubChainRpc,
    };

    #[tokio::test]
    async fn successful_simulation_decodes_footprint() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation(simulate_response_ok(
            Some(soroban_data_b64(false)),
            vec![],
        ));
        let sim = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap();
        assert!(sim.soroban_data.is_some());
        assert!(!is_read_only(&sim));
    }

    #[tokio::test]
    async fn read_only_requires_empty_footprint_and_no_auth() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation(simulate_response_ok(
            Some(soroban_data_b64(true)),
            vec![],
        ));
        let sim = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap();
        assert!(is_read_only(&sim));
    }

    #[tokio::test]
    async fn result_auth_defeats_read_only() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation(simulate_response_ok(
            Some(soroban_data_b64(true)),
            vec!["AUTH".to_string()],
        ));
        let sim = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[auth_entry()],
        )
        .await
        .unwrap();
        assert!(!is_read_only(&sim));
    }

    #[tokio::test]
    async fn undecodable_footprint_defeats_read_only() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation(simulate_response_ok(
            Some("garbage!".to_string()),
            vec![],
        ));
        let sim = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap();
        assert!(sim.soroban_data.is_none());
        assert!(!is_read_only(&sim));
    }

    #[tokio::test]
    async fn transport_failure_maps_to_network_error() {
        let rpc = StubChainRpc::default();
        rpc.fail_simulation_transport("connection refused");
        let err = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SimulationNetworkError);
        assert_eq!(err.status, 502);
    }

    #[tokio::test]
    async fn rpc_failure_maps_to_rpc_error() {
        let rpc = StubChainRpc::default();
        rpc.fail_simulation_rpc(-32600, "invalid request");
        let err = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SimulationRpcFailure);
    }

    #[tokio::test]
    async fn enforce_auth_failure_is_classified() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation_error(
            "host invocation failed: Error(Auth, InvalidInput), \
             data:[\"signature has expired\"]",
        );
        let err = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[auth_entry()],
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.code,
            ErrorCode::SimulationSignedAuthValidationFailed
        );
        assert!(err
            .message
            .contains("signature has expired (Auth, InvalidInput)"));
    }

    #[tokio::test]
    async fn other_simulation_errors_stay_generic() {
        let rpc = StubChainRpc::default();
        rpc.set_simulation_error(
            "HostError: Error(Contract, #13)\ndata:[\"balance too low\"]",
        );
        let err = simulate_host_function(
            &rpc,
            &fund_address(),
            &host_function(),
            &[],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SimulationFailed);
        assert_eq!(err.message, "balance too low (Contract, #13)");
    }

    #[test]
    fn assemble_applies_footprint_and_fee() {
        let response = simulate_response_ok(
            Some(soroban_data_b64(false)),
            vec![],
        );
        let soroban_data = SorobanTransactionData::from_xdr_base64(
            response.transaction_data.as_deref().unwrap(),
            Limits::none(),
        )
        .ok();
        let sim = Simulation {
            response,
            soroban_data,
        };
        let envelope =
            assemble(&fund_address(), 42, &host_function(), &[], &sim)
                .unwrap();
        let TransactionEnvelope::Tx(env) = &envelope else {
            panic!("expected regular envelope");
        };
        assert_eq!(env.tx.seq_num.0, 42);
        assert_eq!(env.tx.fee, 100 + 58_181);
        match &env.tx.ext {
            TransactionExt::V1(data) => {
                assert_eq!(data.resource_fee, 58_181)
            }
            other => panic!("expected soroban ext, got {:?}", other),
        }
    }

    #[test]
    fn error_parsing_prefers_data_array() {
        assert_eq!(
            parse_simulation_error(
                "failure\ndata:[\"insufficient balance\"] trailing"
            ),
            "insufficient balance"
        );
    }

    #[test]
    fn error_parsing_falls_back_to_quoted_data() {
        assert_eq!(
            parse_simulation_error("oops data:\"token not minted\""),
            "token not minted"
        );
    }

    #[test]
    fn error_parsing_ignores_tiny_fragments() {
        assert_eq!(
            parse_simulation_error("first useful line\ndata:[\"ok\"]"),
            "first useful line"
        );
    }

    #[test]
    fn error_parsing_appends_type_tag() {
        assert_eq!(
            parse_simulation_error(
                "Error(Storage, MissingValue) data:[\"missing entry\"]"
            ),
            "missing entry (Storage, MissingValue)"
        );
    }
}
