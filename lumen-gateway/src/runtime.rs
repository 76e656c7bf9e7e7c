use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Network family reported by the hosting runtime for a relayer.
pub const STELLAR_NETWORK_TYPE: &str = "stellar";

#[derive(Debug, Clone)]
pub struct RelayerInfo {
    pub id: String,
    /// The relayer's on-chain account, `G...`.
    pub address: String,
    pub network_type: String,
}

/// What the gateway asks the hosting runtime to put on the wire. With
/// `fee_bump` set, the runtime wraps the inner envelope in a fee-bump
/// envelope paid for (and signed) by the fund account.
#[derive(Debug, Clone)]
pub struct SendTransactionRequest {
    pub network: String,
    pub transaction_xdr: String,
    pub fee_bump: bool,
    pub max_fee: i64,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub transaction_id: String,
    pub hash: String,
}

/// Terminal status record returned by the runtime's wait poller.
#[derive(Debug, Clone)]
pub struct WaitStatus {
    pub status: String,
    pub reason: Option<String>,
    pub latest_ledger: Option<u32>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Relayer runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to send transaction: {0}")]
    Send(String),

    #[error("Failed to sign transaction: {0}")]
    Sign(String),

    #[error("Timed out waiting for transaction to settle")]
    WaitTimeout,
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// The hosting runtime's relayer surface: resolve a relayer, have it sign,
/// submit through it and poll for a terminal status. Everything the
/// gateway cannot do locally lives behind this trait.
#[async_trait]
pub trait RelayerRuntime: Send + Sync {
    async fn get_relayer(
        &self,
        relayer_id: &str,
    ) -> RuntimeResult<Option<RelayerInfo>>;

    /// Returns the relayer's detached signature over the transaction as a
    /// base64 `DecoratedSignature`.
    async fn sign_transaction(
        &self,
        relayer_id: &str,
        transaction_xdr: &str,
    ) -> RuntimeResult<String>;

    async fn send_transaction(
        &self,
        request: SendTransactionRequest,
    ) -> RuntimeResult<Submission>;

    /// Polls every `interval` until the submission reaches a terminal
    /// status or `timeout` elapses ([RuntimeError::WaitTimeout]).
    async fn transaction_wait(
        &self,
        submission: &Submission,
        interval: Duration,
        timeout: Duration,
    ) -> RuntimeResult<WaitStatus>;
}
