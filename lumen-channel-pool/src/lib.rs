mod error;
mod membership;
mod pool;

pub use error::{CapacityReason, PoolError, PoolResult};
pub use membership::{
    load_membership, membership_key, normalize_id, normalize_ids,
    store_membership, MembershipDoc, MAX_ID_LEN,
};
pub use pool::{
    simple_hash, ChannelLease, ChannelLockDoc, ChannelPool,
    ChannelPoolConfig, MAX_SPINS,
};
