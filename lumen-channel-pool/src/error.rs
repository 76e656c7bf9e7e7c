use thiserror::Error;

use lumen_kv::KvError;

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Diagnostic reason attached to a capacity failure, so callers can tell a
/// starved limited-contract partition from a genuinely full pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityReason {
    LimitedContractCapacity,
    AllChannelsBusyOrMutexContention,
}

impl CapacityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityReason::LimitedContractCapacity => {
                "limited_contract_capacity"
            }
            CapacityReason::AllChannelsBusyOrMutexContention => {
                "all_channels_busy_or_mutex_contention"
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("Invalid relayer id '{0}'")]
    InvalidRelayerId(String),

    #[error("No channel accounts are configured")]
    NoChannelsConfigured,

    #[error("Could not acquire a channel account: {}", reason.as_str())]
    PoolCapacity {
        reason: CapacityReason,
        total_channels: usize,
        candidate_channels: usize,
        busy_candidates: usize,
    },
}
