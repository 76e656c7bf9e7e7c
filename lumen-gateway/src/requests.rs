use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use stellar_xdr::curr::{HostFunction, SorobanAuthorizationEntry};

use crate::error::GatewayError;

/// What the hosting runtime hands the gateway for each invocation: the raw
/// request params plus the transport headers.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub params: Value,
    pub headers: HashMap<String, Vec<String>>,
}

impl InboundRequest {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers
            .entry(name.into().to_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    /// First value of the named header, trimmed; empty values count as
    /// absent. Header names compare case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let wanted = name.to_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| key.to_lowercase() == wanted)
            .and_then(|(_, values)| values.first())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

/// The two data-plane request shapes, after validation.
#[derive(Debug, Clone)]
pub enum GatewayRequest {
    /// A fully signed envelope to fee-bump and submit as-is.
    Submit { envelope_xdr: String },
    /// A host-function call the gateway builds, channels and co-signs.
    Build(BuildRequest),
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub func: HostFunction,
    pub auth: Vec<SorobanAuthorizationEntry>,
    pub return_tx_hash: bool,
}

/// Summary of a submission outcome handed back to the caller.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TxSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_ledger: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The wire response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(err: &GatewayError) -> Self {
        let mut data = json!({ "code": err.code.as_str() });
        if let Some(details) = &err.details {
            data["details"] = details.clone();
        }
        Self {
            success: false,
            data: Some(data),
            error: Some(err.message.clone()),
        }
    }
}
