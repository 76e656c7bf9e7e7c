use std::fmt;

use serde_json::{json, Value};

use lumen_channel_pool::PoolError;
use lumen_kv::KvError;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Stable error codes callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ConfigMissing,
    UnsupportedNetwork,
    InvalidParams,
    InvalidXdr,
    InvalidEnvelopeType,
    InvalidTimeBounds,
    FeeMismatch,
    TimeboundsTooFar,
    InvalidUnsignedXdr,
    NoChannelsConfigured,
    PoolCapacity,
    RelayerUnavailable,
    FailedToGetSequence,
    AccountNotFound,
    SimulationNetworkError,
    SimulationRpcFailure,
    SimulationFailed,
    SimulationSignedAuthValidationFailed,
    AssemblyFailed,
    InvalidSignature,
    OnchainFailed,
    WaitTimeout,
    FeeLimitExceeded,
    ApiKeyRequired,
    ManagementDisabled,
    Unauthorized,
    LockedConflict,
    InvalidPayload,
    InvalidAction,
    KvError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        use ErrorCode::*;
        match self {
            ConfigMissing => "CONFIG_MISSING",
            UnsupportedNetwork => "UNSUPPORTED_NETWORK",
            InvalidParams => "INVALID_PARAMS",
            InvalidXdr => "INVALID_XDR",
            InvalidEnvelopeType => "INVALID_ENVELOPE_TYPE",
            InvalidTimeBounds => "INVALID_TIME_BOUNDS",
            FeeMismatch => "FEE_MISMATCH",
            TimeboundsTooFar => "TIMEBOUNDS_TOO_FAR",
            InvalidUnsignedXdr => "INVALID_UNSIGNED_XDR",
            NoChannelsConfigured => "NO_CHANNELS_CONFIGURED",
            PoolCapacity => "POOL_CAPACITY",
            RelayerUnavailable => "RELAYER_UNAVAILABLE",
            FailedToGetSequence => "FAILED_TO_GET_SEQUENCE",
            AccountNotFound => "ACCOUNT_NOT_FOUND",
            SimulationNetworkError => "SIMULATION_NETWORK_ERROR",
            SimulationRpcFailure => "SIMULATION_RPC_FAILURE",
            SimulationFailed => "SIMULATION_FAILED",
            SimulationSignedAuthValidationFailed => {
                "SIMULATION_SIGNED_AUTH_VALIDATION_FAILED"
            }
            AssemblyFailed => "ASSEMBLY_FAILED",
            InvalidSignature => "INVALID_SIGNATURE",
            OnchainFailed => "ONCHAIN_FAILED",
            WaitTimeout => "WAIT_TIMEOUT",
            FeeLimitExceeded => "FEE_LIMIT_EXCEEDED",
            ApiKeyRequired => "API_KEY_REQUIRED",
            ManagementDisabled => "MANAGEMENT_DISABLED",
            Unauthorized => "UNAUTHORIZED",
            LockedConflict => "LOCKED_CONFLICT",
            InvalidPayload => "INVALID_PAYLOAD",
            InvalidAction => "INVALID_ACTION",
            KvError => "KV_ERROR",
        }
    }

    /// HTTP-ish status attached to the code.
    pub fn status(&self) -> u16 {
        use ErrorCode::*;
        match self {
            ConfigMissing | UnsupportedNetwork | RelayerUnavailable
            | AssemblyFailed | KvError => 500,
            InvalidParams | InvalidXdr | InvalidEnvelopeType
            | InvalidTimeBounds | FeeMismatch | TimeboundsTooFar
            | InvalidUnsignedXdr | SimulationFailed
            | SimulationSignedAuthValidationFailed | InvalidSignature
            | OnchainFailed | ApiKeyRequired | InvalidPayload
            | InvalidAction | AccountNotFound => 400,
            Unauthorized => 401,
            ManagementDisabled => 403,
            LockedConflict => 409,
            FeeLimitExceeded => 429,
            NoChannelsConfigured | PoolCapacity => 503,
            SimulationNetworkError | SimulationRpcFailure
            | FailedToGetSequence => 502,
            WaitTimeout => 504,
        }
    }
}

/// The structured error every component surfaces: a stable `code` for
/// programmatic handling, an HTTP-ish `status`, a human-readable message
/// and optional sanitized `details`.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub code: ErrorCode,
    pub status: u16,
    pub message: String,
    pub details: Option<Value>,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: code.status(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            code,
            status: code.status(),
            message: message.into(),
            details: Some(details),
        }
    }
}

impl From<KvError> for GatewayError {
    fn from(err: KvError) -> Self {
        GatewayError::new(ErrorCode::KvError, err.to_string())
    }
}

impl From<PoolError> for GatewayError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Kv(err) => err.into(),
            PoolError::InvalidRelayerId(id) => GatewayError::with_details(
                ErrorCode::InvalidPayload,
                format!("invalid relayer id '{}'", id),
                json!({ "relayerId": id }),
            ),
            PoolError::NoChannelsConfigured => GatewayError::new(
                ErrorCode::NoChannelsConfigured,
                "no channel accounts are configured",
            ),
            PoolError::PoolCapacity {
                reason,
                total_channels,
                candidate_channels,
                busy_candidates,
            } => GatewayError::with_details(
                ErrorCode::PoolCapacity,
                "could not acquire a channel account",
                json!({
                    "reason": reason.as_str(),
                    "totalChannels": total_channels,
                    "candidateChannels": candidate_channels,
                    "busyCandidates": busy_candidates,
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(ErrorCode::ConfigMissing.status(), 500);
        assert_eq!(ErrorCode::InvalidParams.status(), 400);
        assert_eq!(ErrorCode::FeeLimitExceeded.status(), 429);
        assert_eq!(ErrorCode::Unauthorized.status(), 401);
        assert_eq!(ErrorCode::ManagementDisabled.status(), 403);
        assert_eq!(ErrorCode::LockedConflict.status(), 409);
        assert_eq!(ErrorCode::PoolCapacity.status(), 503);
        assert_eq!(ErrorCode::SimulationNetworkError.status(), 502);
        assert_eq!(ErrorCode::OnchainFailed.status(), 400);
        assert_eq!(ErrorCode::WaitTimeout.status(), 504);
    }

    #[test]
    fn pool_capacity_details_carry_diagnostics() {
        let err: GatewayError = PoolError::PoolCapacity {
            reason:
                lumen_channel_pool::CapacityReason::LimitedContractCapacity,
            total_channels: 4,
            candidate_channels: 2,
            busy_candidates: 2,
        }
        .into();
        assert_eq!(err.code, ErrorCode::PoolCapacity);
        assert_eq!(err.status, 503);
        let details = err.details.unwrap();
        assert_eq!(details["reason"], "limited_contract_capacity");
        assert_eq!(details["candidateChannels"], 2);
    }
}
