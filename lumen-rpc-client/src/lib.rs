use std::time::Duration;

use async_trait::async_trait;
use log::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

mod utils;

pub use utils::{
    account_id_from_address, account_ledger_key,
    account_sequence_from_entry, network_id, transaction_hash,
};

/// Default Soroban RPC endpoints per network.
pub const TESTNET_RPC_URL: &str = "https://soroban-testnet.stellar.org";
pub const MAINNET_RPC_URL: &str =
    "https://soroban-rpc.mainnet.stellar.gateway.fm";

pub const TESTNET_PASSPHRASE: &str = "Test SDF Network ; September 2015";
pub const MAINNET_PASSPHRASE: &str =
    "Public Global Stellar Network ; September 2015";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// -----------------
// SorobanRpcClientError
// -----------------
#[derive(Debug, thiserror::Error)]
pub enum SorobanRpcClientError {
    #[error("Transport error calling '{0}': {1}")]
    Transport(&'static str, String),

    #[error("RPC error from '{method}' (code {code}): {message}")]
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },

    #[error("Malformed response from '{0}': {1}")]
    MalformedResponse(&'static str, String),

    #[error("XDR error: {0}")]
    Xdr(String),
}

pub type SorobanRpcClientResult<T> =
    std::result::Result<T, SorobanRpcClientError>;

// -----------------
// Wire types
// -----------------
#[derive(Debug, Serialize)]
struct RpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: T,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[allow(dead_code)]
    id: Option<u64>,
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// The auth mode `simulateTransaction` runs with. Enforce validates the
/// signatures on provided authorization entries during simulation, which
/// surfaces expired or invalid entries before anything hits the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Enforce,
    Record,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Enforce => "enforce",
            AuthMode::Record => "record",
        }
    }
}

#[derive(Debug, Serialize)]
struct SimulateTransactionParams<'a> {
    transaction: &'a str,
    #[serde(rename = "authMode")]
    auth_mode: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateTransactionResponse {
    pub latest_ledger: Option<u32>,
    /// Stroops, decimal string.
    pub min_resource_fee: Option<String>,
    /// Base64 `SorobanTransactionData` to apply to the assembled transaction.
    pub transaction_data: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub results: Vec<SimulateHostFunctionResult>,
    /// Base64 diagnostic events emitted during simulation.
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulateHostFunctionResult {
    pub xdr: Option<String>,
    #[serde(default)]
    pub auth: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GetLedgerEntriesParams<'a> {
    keys: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLedgerEntriesResponse {
    #[serde(default)]
    pub entries: Option<Vec<LedgerEntryResult>>,
    pub latest_ledger: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryResult {
    pub key: String,
    pub xdr: String,
    pub last_modified_ledger_seq: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SendTransactionParams<'a> {
    transaction: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionResponse {
    pub status: String,
    pub hash: String,
    pub error_result_xdr: Option<String>,
    pub latest_ledger: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GetTransactionParams<'a> {
    hash: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTransactionResponse {
    pub status: String,
    pub latest_ledger: Option<u32>,
    pub ledger: Option<u32>,
    pub result_xdr: Option<String>,
    pub result_meta_xdr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLatestLedgerResponse {
    pub sequence: u32,
    pub id: Option<String>,
}

// -----------------
// ChainRpc
// -----------------

/// The chain RPC surface the gateway depends on. Implemented by
/// [SorobanRpcClient]; tests substitute canned responses.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn simulate_transaction(
        &self,
        transaction_xdr: &str,
        auth_mode: AuthMode,
    ) -> SorobanRpcClientResult<SimulateTransactionResponse>;

    async fn get_ledger_entries(
        &self,
        keys: &[String],
    ) -> SorobanRpcClientResult<GetLedgerEntriesResponse>;
}

// -----------------
// SorobanRpcClient
// -----------------

/// Thin wrapper around a Soroban JSON-RPC endpoint providing the typed
/// calls the gateway needs.
#[derive(Clone)]
pub struct SorobanRpcClient {
    http: reqwest::Client,
    url: String,
}

impl SorobanRpcClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &'static str,
        params: P,
    ) -> SorobanRpcClientResult<R> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        trace!("Calling {} on {}", method, self.url);
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                SorobanRpcClientError::Transport(method, err.to_string())
            })?;

        let response: RpcResponse<R> =
            response.json().await.map_err(|err| {
                SorobanRpcClientError::Transport(method, err.to_string())
            })?;

        if let Some(error) = response.error {
            return Err(SorobanRpcClientError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
        }

        response.result.ok_or_else(|| {
            SorobanRpcClientError::MalformedResponse(
                method,
                "response carried neither result nor error".to_string(),
            )
        })
    }

    pub async fn send_transaction(
        &self,
        transaction_xdr: &str,
    ) -> SorobanRpcClientResult<SendTransactionResponse> {
        self.request(
            "sendTransaction",
            SendTransactionParams {
                transaction: transaction_xdr,
            },
        )
        .await
    }

    pub async fn get_transaction(
        &self,
        hash: &str,
    ) -> SorobanRpcClientResult<GetTransactionResponse> {
        self.request("getTransaction", GetTransactionParams { hash })
            .await
    }

    pub async fn get_latest_ledger(
        &self,
    ) -> SorobanRpcClientResult<GetLatestLedgerResponse> {
        // getLatestLedger rejects an empty params object, so the request is
        // built by hand without one.
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getLatestLedger",
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                SorobanRpcClientError::Transport(
                    "getLatestLedger",
                    err.to_string(),
                )
            })?;
        let response: RpcResponse<GetLatestLedgerResponse> =
            response.json().await.map_err(|err| {
                SorobanRpcClientError::Transport(
                    "getLatestLedger",
                    err.to_string(),
                )
            })?;
        if let Some(error) = response.error {
            return Err(SorobanRpcClientError::Rpc {
                method: "getLatestLedger",
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or_else(|| {
            SorobanRpcClientError::MalformedResponse(
                "getLatestLedger",
                "response carried neither result nor error".to_string(),
            )
        })
    }
}

#[async_trait]
impl ChainRpc for SorobanRpcClient {
    async fn simulate_transaction(
        &self,
        transaction_xdr: &str,
        auth_mode: AuthMode,
    ) -> SorobanRpcClientResult<SimulateTransactionResponse> {
        self.request(
            "simulateTransaction",
            SimulateTransactionParams {
                transaction: transaction_xdr,
                auth_mode: auth_mode.as_str(),
            },
        )
        .await
    }

    async fn get_ledger_entries(
        &self,
        keys: &[String],
    ) -> SorobanRpcClientResult<GetLedgerEntriesResponse> {
        self.request("getLedgerEntries", GetLedgerEntriesParams { keys })
            .await
    }
}
