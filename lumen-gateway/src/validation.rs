use serde_json::Value;
use stellar_xdr::curr::{
    HostFunction, Limits, ReadXdr, SorobanAuthorizationEntry,
    SorobanCredentials,
};

use crate::{
    error::{ErrorCode, GatewayError, GatewayResult},
    requests::{BuildRequest, GatewayRequest},
};

/// Parses and validates the data-plane request params.
///
/// Exactly one of the two shapes is accepted: `{xdr}` (strict, no other
/// keys) or `{func, auth}` with an optional `returnTxHash`. Anything else
/// is `INVALID_PARAMS`.
pub fn parse_request(params: &Value) -> GatewayResult<GatewayRequest> {
    let object = params.as_object().ok_or_else(|| {
        invalid_params("params must be a JSON object")
    })?;

    let has_xdr = object.contains_key("xdr");
    let has_func = object.contains_key("func");
    let has_auth = object.contains_key("auth");

    if has_xdr && (has_func || has_auth) {
        return Err(invalid_params(
            "provide either 'xdr' or 'func'+'auth', not both",
        ));
    }

    if has_xdr {
        if object.len() != 1 {
            return Err(invalid_params(
                "'xdr' requests accept no other fields",
            ));
        }
        let envelope_xdr = object
            .get("xdr")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|xdr| !xdr.is_empty())
            .ok_or_else(|| {
                invalid_params("'xdr' must be a non-empty string")
            })?;
        return Ok(GatewayRequest::Submit {
            envelope_xdr: envelope_xdr.to_string(),
        });
    }

    if !(has_func && has_auth) {
        return Err(invalid_params(
            "expected either 'xdr' or both 'func' and 'auth'",
        ));
    }
    for key in object.keys() {
        if !matches!(key.as_str(), "func" | "auth" | "returnTxHash") {
            return Err(invalid_params(format!(
                "unexpected field '{}'",
                key
            )));
        }
    }

    let func_b64 = object
        .get("func")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_params("'func' must be a string"))?;
    let func = HostFunction::from_xdr_base64(func_b64, Limits::none())
        .map_err(|err| {
            invalid_params(format!("cannot decode host function: {}", err))
        })?;

    let auth_values = object
        .get("auth")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid_params("'auth' must be an array"))?;
    let mut auth = Vec::with_capacity(auth_values.len());
    for (idx, entry) in auth_values.iter().enumerate() {
        let entry_b64 = entry.as_str().ok_or_else(|| {
            invalid_params(format!("auth[{}] must be a string", idx))
        })?;
        let entry = SorobanAuthorizationEntry::from_xdr_base64(
            entry_b64,
            Limits::none(),
        )
        .map_err(|err| {
            invalid_params(format!(
                "cannot decode auth[{}]: {}",
                idx, err
            ))
        })?;
        auth.push(entry);
    }
    reject_source_account_credentials(&auth)?;

    let return_tx_hash = object
        .get("returnTxHash")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Ok(GatewayRequest::Build(BuildRequest {
        func,
        auth,
        return_tx_hash,
    }))
}

/// Source-account credentials would bind the signature to the transaction
/// source, which is a pooled channel here. Every entry point feeding the
/// build pipeline must apply this check.
pub(crate) fn reject_source_account_credentials(
    auth: &[SorobanAuthorizationEntry],
) -> GatewayResult<()> {
    for (idx, entry) in auth.iter().enumerate() {
        if matches!(entry.credentials, SorobanCredentials::SourceAccount) {
            return Err(invalid_params(format!(
                "auth[{}] uses source-account credentials, which are \
                 incompatible with channel-signed transactions",
                idx
            )));
        }
    }
    Ok(())
}

fn invalid_params(message: impl Into<String>) -> GatewayError {
    GatewayError::new(ErrorCode::InvalidParams, message)
}
