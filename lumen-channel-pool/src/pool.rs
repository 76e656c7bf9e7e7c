use std::{collections::HashSet, sync::Arc, time::Duration};

use log::*;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};

use lumen_kv::{
    get_typed, random_token, with_lock, KvStore, OnBusy,
};

use crate::{
    error::{CapacityReason, PoolError, PoolResult},
    membership::load_membership,
};

/// How many times an acquire spins on the pool mutex / a full pool before
/// giving up with a capacity failure.
pub const MAX_SPINS: u32 = 30;

/// TTL of the short-lived mutex guarding the select-and-claim section.
const POOL_MUTEX_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLockDoc {
    pub token: String,
    #[serde(rename = "lockedAt")]
    pub locked_at: u64,
}

/// An exclusive lease on one channel account. The holder must release or
/// extend it; the TTL reclaims it if the holder dies.
#[derive(Debug, Clone)]
pub struct ChannelLease {
    pub relayer_id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct ChannelPoolConfig {
    /// Channel-lock TTL, already clamped by config parsing.
    pub lock_ttl: Duration,
    /// Fraction of the pool limited contracts may occupy.
    pub capacity_ratio: f64,
    pub limited_contracts: HashSet<String>,
}

/// Hands out exclusive channel-account leases, fairly across a dynamic
/// member list, with bounded capacity per contract class. All coordination
/// state lives in the shared KV store so any number of gateway replicas can
/// run against the same pool.
pub struct ChannelPool {
    kv: Arc<dyn KvStore>,
    prefix: String,
    config: ChannelPoolConfig,
}

impl ChannelPool {
    pub fn new(
        kv: Arc<dyn KvStore>,
        network_prefix: impl Into<String>,
        config: ChannelPoolConfig,
    ) -> Self {
        Self {
            kv,
            prefix: network_prefix.into(),
            config,
        }
    }

    pub fn lock_key(&self, relayer_id: &str) -> String {
        format!("{}:channel:in-use:{}", self.prefix, relayer_id)
    }

    fn mutex_key(&self) -> String {
        format!("{}:channel-pool-lock", self.prefix)
    }

    // -----------------
    // Acquire
    // -----------------

    /// Acquires an exclusive channel lease for a request.
    ///
    /// Each attempt runs under the pool's global mutex: re-read membership,
    /// partition for limited contracts, shuffle, claim the first free
    /// candidate. Mutex contention and a fully busy pool both back off
    /// 10–30 ms and retry, up to [MAX_SPINS].
    pub async fn acquire(
        &self,
        contract_id: Option<&str>,
    ) -> PoolResult<ChannelLease> {
        let mut last_total = 0usize;
        let mut last_candidates = 0usize;
        let mut observed_pool = false;

        for spin in 0..MAX_SPINS {
            let claimed = with_lock(
                self.kv.as_ref(),
                &self.mutex_key(),
                POOL_MUTEX_TTL,
                OnBusy::Skip,
                || self.select_and_claim(contract_id),
            )
            .await?;

            match claimed {
                Some(Ok(lease)) => return Ok(lease),
                Some(Err((total, candidates))) => {
                    last_total = total;
                    last_candidates = candidates;
                    observed_pool = true;
                    trace!(
                        "Acquire spin {}: all {} of {} members busy",
                        spin,
                        candidates,
                        total
                    );
                }
                // Mutex busy; another replica is inside select-and-claim.
                None => trace!("Acquire spin {}: pool mutex contended", spin),
            }

            let jitter = rand::thread_rng().gen_range(10..=30);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let limited = contract_id
            .is_some_and(|id| self.config.limited_contracts.contains(id));
        let reason = if limited && observed_pool && last_candidates < last_total
        {
            CapacityReason::LimitedContractCapacity
        } else {
            CapacityReason::AllChannelsBusyOrMutexContention
        };
        Err(PoolError::PoolCapacity {
            reason,
            total_channels: last_total,
            candidate_channels: last_candidates,
            busy_candidates: last_candidates,
        })
    }

    /// The critical section: pick a free candidate and write its lock.
    /// Returns `Err((total, candidates))` when every candidate is busy.
    async fn select_and_claim(
        &self,
        contract_id: Option<&str>,
    ) -> PoolResult<Result<ChannelLease, (usize, usize)>> {
        let members =
            load_membership(self.kv.as_ref(), &self.prefix).await?;
        if members.is_empty() {
            return Err(PoolError::NoChannelsConfigured);
        }
        let total = members.len();

        let mut candidates = self.partition(&members, contract_id);
        let candidate_count = candidates.len();
        candidates.shuffle(&mut rand::thread_rng());

        for relayer_id in candidates {
            let key = self.lock_key(&relayer_id);
            let token = random_token();
            let doc = ChannelLockDoc {
                token: token.clone(),
                locked_at: epoch_ms(),
            };
            let doc = serde_json::to_value(&doc)
                .map_err(|err| lumen_kv::KvError::Encode(key.clone(), err))?;
            // A free channel is exactly one whose lock key is absent.
            if self
                .kv
                .set_if_absent(&key, doc, Some(self.config.lock_ttl))
                .await?
            {
                debug!("Claimed channel '{}'", relayer_id);
                return Ok(Ok(ChannelLease { relayer_id, token }));
            }
        }

        Ok(Err((total, candidate_count)))
    }

    /// The candidate subset a contract may draw from. Limited contracts see
    /// a deterministic slice of the membership: sorted by `simple_hash`
    /// (ties on the id itself), first `max(1, ⌊ratio·N⌋)` entries. The
    /// slice depends only on membership and ratio, never on the caller.
    fn partition(
        &self,
        members: &[String],
        contract_id: Option<&str>,
    ) -> Vec<String> {
        let limited = contract_id
            .is_some_and(|id| self.config.limited_contracts.contains(id));
        if !limited {
            return members.to_vec();
        }

        let mut sorted = members.to_vec();
        sorted.sort_by(|a, b| {
            simple_hash(a)
                .cmp(&simple_hash(b))
                .then_with(|| a.cmp(b))
        });
        let k = ((self.config.capacity_ratio * members.len() as f64).floor()
            as usize)
            .max(1);
        sorted.truncate(k);
        sorted
    }

    // -----------------
    // Release / Extend
    // -----------------

    /// Releases a lease. A mismatched token is a no-op, which protects
    /// against late releases after the TTL already reclaimed the channel
    /// for someone else. KV errors are swallowed; the TTL cleans up.
    pub async fn release(&self, lease: &ChannelLease) {
        let key = self.lock_key(&lease.relayer_id);
        let stored: Option<ChannelLockDoc> =
            match get_typed(self.kv.as_ref(), &key).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(
                        "Failed to read lock for '{}' during release: {:?}",
                        lease.relayer_id, err
                    );
                    return;
                }
            };
        let Some(stored) = stored else {
            return;
        };
        if stored.token != lease.token {
            debug!(
                "Channel '{}' is locked by another owner, skipping release",
                lease.relayer_id
            );
            return;
        }
        if let Err(err) = self.kv.del(&key).await {
            warn!(
                "Failed to release channel '{}': {:?}",
                lease.relayer_id, err
            );
        }
    }

    /// Refreshes the TTL of a held lease, keeping the channel reserved
    /// while an in-flight transaction settles. Errors are swallowed.
    pub async fn extend(&self, lease: &ChannelLease) {
        let key = self.lock_key(&lease.relayer_id);
        let stored: Option<ChannelLockDoc> =
            match get_typed(self.kv.as_ref(), &key).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(
                        "Failed to read lock for '{}' during extend: {:?}",
                        lease.relayer_id, err
                    );
                    return;
                }
            };
        let Some(stored) = stored else {
            return;
        };
        if stored.token != lease.token {
            return;
        }
        let doc = match serde_json::to_value(&stored) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("Failed to encode lock doc: {:?}", err);
                return;
            }
        };
        if let Err(err) =
            self.kv.set(&key, doc, Some(self.config.lock_ttl)).await
        {
            warn!(
                "Failed to extend lock on channel '{}': {:?}",
                lease.relayer_id, err
            );
        }
    }

    // -----------------
    // Probes
    // -----------------

    pub async fn is_locked(&self, relayer_id: &str) -> PoolResult<bool> {
        Ok(self.kv.exists(&self.lock_key(relayer_id)).await?)
    }

    /// Relayer ids with a live lock entry.
    pub async fn locked_channels(&self) -> PoolResult<Vec<String>> {
        let prefix = format!("{}:channel:in-use:", self.prefix);
        let keys = self.kv.list_keys(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix).map(str::to_string)
            })
            .collect())
    }
}

/// Weak but stable string hash (shift-mix over bytes). Good enough to
/// spread the partition; deliberately not adversarially robust.
pub fn simple_hash(s: &str) -> u32 {
    s.bytes().fold(0u32, |hash, byte| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(byte as u32)
    })
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::store_membership;
    use lumen_kv::MemoryKv;

    const CONTRACT: &str =
        "CA3D5KRYM6CB7OWQ6TWYRR3Z4T7GNZLKERYNZGGA5SOAOPIFY6YQGAXE";

    fn pool_with(
        kv: Arc<MemoryKv>,
        ratio: f64,
        limited: &[&str],
    ) -> ChannelPool {
        ChannelPool::new(
            kv,
            "testnet",
            ChannelPoolConfig {
                lock_ttl: Duration::from_secs(30),
                capacity_ratio: ratio,
                limited_contracts: limited
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        )
    }

    async fn seed_members(kv: &MemoryKv, ids: &[&str]) {
        store_membership(
            kv,
            "testnet",
            ids.iter().map(|s| s.to_string()).collect(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquires_get_distinct_channels() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1", "p2"]).await;
        let pool = Arc::new(pool_with(kv, 0.8, &[]));

        let (a, b) = tokio::join!(
            {
                let pool = Arc::clone(&pool);
                async move { pool.acquire(None).await }
            },
            {
                let pool = Arc::clone(&pool);
                async move { pool.acquire(None).await }
            }
        );
        let a = a.unwrap();
        let b = b.unwrap();
        let mut got = vec![a.relayer_id.clone(), b.relayer_id.clone()];
        got.sort();
        assert_eq!(got, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn exhausted_pool_reports_all_busy() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1", "p2"]).await;
        let pool = pool_with(kv, 0.8, &[]);

        pool.acquire(None).await.unwrap();
        pool.acquire(None).await.unwrap();

        match pool.acquire(None).await {
            Err(PoolError::PoolCapacity {
                reason,
                total_channels,
                busy_candidates,
                ..
            }) => {
                assert_eq!(
                    reason,
                    CapacityReason::AllChannelsBusyOrMutexContention
                );
                assert_eq!(total_channels, 2);
                assert_eq!(busy_candidates, 2);
            }
            other => panic!("expected capacity failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn limited_contract_is_capped_to_partition() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1", "p2"]).await;
        let pool = pool_with(kv, 0.5, &[CONTRACT]);

        pool.acquire(Some(CONTRACT)).await.unwrap();
        match pool.acquire(Some(CONTRACT)).await {
            Err(PoolError::PoolCapacity {
                reason,
                candidate_channels,
                ..
            }) => {
                assert_eq!(
                    reason,
                    CapacityReason::LimitedContractCapacity
                );
                assert_eq!(candidate_channels, 1);
            }
            other => panic!("expected capacity failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unlimited_contract_sees_whole_pool() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1", "p2"]).await;
        let pool = pool_with(kv, 0.5, &[CONTRACT]);

        // Unrelated contract ids are not partitioned.
        pool.acquire(Some("OTHER")).await.unwrap();
        pool.acquire(Some("OTHER")).await.unwrap();
    }

    #[tokio::test]
    async fn empty_membership_fails_fast() {
        let kv = Arc::new(MemoryKv::new());
        let pool = pool_with(kv, 0.8, &[]);
        assert!(matches!(
            pool.acquire(None).await,
            Err(PoolError::NoChannelsConfigured)
        ));
    }

    #[tokio::test]
    async fn release_honors_token() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1"]).await;
        let pool = pool_with(Arc::clone(&kv), 0.8, &[]);

        let lease = pool.acquire(None).await.unwrap();
        let impostor = ChannelLease {
            relayer_id: lease.relayer_id.clone(),
            token: "not-the-token".to_string(),
        };
        pool.release(&impostor).await;
        assert!(pool.is_locked(&lease.relayer_id).await.unwrap());

        pool.release(&lease).await;
        assert!(!pool.is_locked(&lease.relayer_id).await.unwrap());
        // Releasing twice is fine.
        pool.release(&lease).await;
    }

    #[tokio::test]
    async fn extend_keeps_the_lease_alive() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1"]).await;
        let pool = ChannelPool::new(
            Arc::clone(&kv) as Arc<dyn lumen_kv::KvStore>,
            "testnet",
            ChannelPoolConfig {
                lock_ttl: Duration::from_millis(150),
                capacity_ratio: 0.8,
                limited_contracts: HashSet::new(),
            },
        );

        let lease = pool.acquire(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.extend(&lease).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Without the extend the 150 ms TTL would have expired by now.
        assert!(pool.is_locked(&lease.relayer_id).await.unwrap());

        // A mismatched token must not refresh the lease.
        let impostor = ChannelLease {
            relayer_id: lease.relayer_id.clone(),
            token: "not-the-token".to_string(),
        };
        pool.extend(&impostor).await;
        assert!(pool.is_locked(&lease.relayer_id).await.unwrap());
    }

    #[tokio::test]
    async fn locked_channels_lists_live_locks() {
        let kv = Arc::new(MemoryKv::new());
        seed_members(&kv, &["p1", "p2"]).await;
        let pool = pool_with(kv, 0.8, &[]);

        let lease = pool.acquire(None).await.unwrap();
        let locked = pool.locked_channels().await.unwrap();
        assert_eq!(locked, vec![lease.relayer_id.clone()]);
    }

    #[test]
    fn partition_is_deterministic_and_bounded() {
        let kv = Arc::new(MemoryKv::new());
        let pool = pool_with(kv, 0.5, &[CONTRACT]);
        let members: Vec<String> = (1..=10)
            .map(|n| format!("relayer-{}", n))
            .collect();

        let first = pool.partition(&members, Some(CONTRACT));
        assert_eq!(first.len(), 5);
        for _ in 0..10 {
            assert_eq!(pool.partition(&members, Some(CONTRACT)), first);
        }
    }

    #[test]
    fn partition_floor_is_one() {
        let kv = Arc::new(MemoryKv::new());
        let pool = pool_with(kv, 0.1, &[CONTRACT]);
        let members = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(pool.partition(&members, Some(CONTRACT)).len(), 1);
    }

    #[test]
    fn simple_hash_is_stable() {
        assert_eq!(simple_hash("p1"), simple_hash("p1"));
        assert_ne!(simple_hash("p1"), simple_hash("p2"));
    }
}
