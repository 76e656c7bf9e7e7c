use std::time::Duration;

use log::*;
use serde_json::json;
use stellar_xdr::curr::{
    Limits, ReadXdr, TransactionResult, TransactionResultResult,
};

use crate::{
    config::Network,
    error::{ErrorCode, GatewayError, GatewayResult},
    fees::FeeTracker,
    runtime::{RelayerRuntime, SendTransactionRequest},
};

/// Poll cadence and hard cap for the terminal-status wait.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(25);

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub transaction_id: String,
    pub hash: String,
    pub status: String,
}

/// Submits a signed inner envelope through the hosting runtime (which
/// wraps it in a fund-signed fee-bump) and waits for a terminal status.
///
/// Fee usage is recorded for confirmed and failed submissions: both
/// consumed the fee. A wait timeout records nothing because the outcome is
/// unknown.
pub async fn submit_and_wait(
    runtime: &dyn RelayerRuntime,
    network: Network,
    envelope_xdr: &str,
    max_fee: i64,
    tracker: Option<&FeeTracker>,
) -> GatewayResult<SubmitOutcome> {
    let submission = runtime
        .send_transaction(SendTransactionRequest {
            network: network.as_str().to_string(),
            transaction_xdr: envelope_xdr.to_string(),
            fee_bump: true,
            max_fee,
        })
        .await
        .map_err(|err| {
            GatewayError::new(
                ErrorCode::RelayerUnavailable,
                format!("send_transaction failed: {}", err),
            )
        })?;

    debug!(
        "Submitted transaction {} ({}), waiting for terminal status",
        submission.transaction_id, submission.hash
    );

    let status = match runtime
        .transaction_wait(&submission, WAIT_POLL_INTERVAL, WAIT_TIMEOUT)
        .await
    {
        Ok(status) => status,
        Err(_) => {
            // Outcome unknown: the transaction may still land, so the fee
            // is not recorded and the caller decides what to do with the
            // open channel.
            return Err(GatewayError::with_details(
                ErrorCode::WaitTimeout,
                "timed out waiting for transaction to settle",
                json!({
                    "id": submission.transaction_id,
                    "hash": submission.hash,
                }),
            ));
        }
    };

    match status.status.as_str() {
        "confirmed" => {
            record_fee(tracker, max_fee).await;
            Ok(SubmitOutcome {
                transaction_id: submission.transaction_id,
                hash: submission.hash,
                status: "confirmed".to_string(),
            })
        }
        "failed" => {
            // The network charged for the attempt even though it failed.
            record_fee(tracker, max_fee).await;

            let raw_reason = status.reason.unwrap_or_default();
            let result_code = decode_result_code(&raw_reason);
            let reason = sanitize_reason(&raw_reason);
            let lab_url = lab_url(network, &submission.hash);
            Err(GatewayError::with_details(
                ErrorCode::OnchainFailed,
                format!("transaction failed on chain: {}", reason),
                json!({
                    "status": "failed",
                    "reason": reason,
                    "id": submission.transaction_id,
                    "hash": submission.hash,
                    "resultCode": result_code,
                    "labUrl": lab_url,
                }),
            ))
        }
        other => {
            // Not terminal from our point of view; surface it and let the
            // handler keep the channel reserved. No fee recorded.
            Ok(SubmitOutcome {
                transaction_id: submission.transaction_id,
                hash: submission.hash,
                status: other.to_string(),
            })
        }
    }
}

async fn record_fee(tracker: Option<&FeeTracker>, max_fee: i64) {
    if let Some(tracker) = tracker {
        tracker.record_usage(max_fee).await;
    }
}

/// Transaction-inspector URL for a hash, parameterized per network.
pub fn lab_url(network: Network, hash: &str) -> String {
    let segment = match network {
        Network::Testnet => "testnet",
        Network::Mainnet => "public",
    };
    format!("https://stellar.expert/explorer/{}/tx/{}", segment, hash)
}

/// Digs a `TransactionResult` out of a failure reason and renders its
/// result code. Fee-bump inner failures unwrap to `<outer>:<inner>`.
pub fn decode_result_code(reason: &str) -> Option<String> {
    let trimmed = reason.trim();
    let candidates = std::iter::once(trimmed)
        .chain(trimmed.split(|c: char| c.is_whitespace() || c == ':'));

    for candidate in candidates {
        if candidate.len() < 8 {
            continue;
        }
        if let Ok(result) =
            TransactionResult::from_xdr_base64(candidate, Limits::none())
        {
            return Some(render_result_code(&result));
        }
    }
    None
}

fn render_result_code(result: &TransactionResult) -> String {
    match &result.result {
        TransactionResultResult::TxFeeBumpInnerFailed(pair) => {
            format!(
                "{}:{}",
                snake_case(result.result.name()),
                snake_case(pair.result.result.name())
            )
        }
        other => snake_case(other.name()),
    }
}

/// `TxBadSeq` → `tx_bad_seq`, matching how SDKs spell result codes.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Distills a raw failure reason into something a caller can read: the
/// last colon-separated segment when it is long enough and free of
/// provider sentinels, else a truncation with sentinel-bearing segments
/// dropped.
pub fn sanitize_reason(raw: &str) -> String {
    const MAX_LEN: usize = 100;
    const SENTINEL: &str = "provider";

    let segments: Vec<&str> = raw.split(':').collect();
    if let Some(last) = segments.last() {
        let last = last.trim();
        if last.len() >= 3 && !last.to_lowercase().contains(SENTINEL) {
            return last.to_string();
        }
    }

    if segments.len() > 1 {
        let kept: Vec<&str> = segments
            .iter()
            .map(|segment| segment.trim())
            .filter(|segment| {
                !segment.is_empty()
                    && !segment.to_lowercase().contains(SENTINEL)
            })
            .collect();
        if !kept.is_empty() {
            return truncate(&kept.join(":"), MAX_LEN);
        }
    }

    truncate(raw, MAX_LEN)
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        raw.to_string()
    } else {
        raw.chars().take(max).collect()
    }
}
