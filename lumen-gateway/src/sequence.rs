use std::{sync::Arc, time::Duration};

use log::*;
use serde::{Deserialize, Serialize};

use lumen_kv::{get_typed, set_typed, KvStore};
use lumen_rpc_client::{
    account_ledger_key, account_sequence_from_entry, ChainRpc,
};

use crate::error::{ErrorCode, GatewayError, GatewayResult};

#[derive(Debug, Serialize, Deserialize)]
struct SequenceDoc {
    /// Decimal string, matching how the ledger renders sequence numbers.
    sequence: String,
    #[serde(rename = "storedAt")]
    stored_at: u64,
}

/// Caches the next usable sequence number per channel address.
///
/// After a transaction confirms, the ledger-entries RPC can keep returning
/// the pre-increment sequence for a short read-after-write window; handing
/// that stale value to the next builder causes `tx_bad_seq`. Committing
/// `used + 1` here bridges the window, and the age bound keeps the cache
/// from outliving its usefulness.
///
/// Every value this cache hands out is ready to be placed on a
/// transaction as-is: the chain fallback already accounts for the
/// one-past-current convention.
pub struct SequenceCache {
    kv: Arc<dyn KvStore>,
    rpc: Arc<dyn ChainRpc>,
    prefix: String,
    max_age: Duration,
}

impl SequenceCache {
    pub fn new(
        kv: Arc<dyn KvStore>,
        rpc: Arc<dyn ChainRpc>,
        network_prefix: impl Into<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            kv,
            rpc,
            prefix: network_prefix.into(),
            max_age,
        }
    }

    fn seq_key(&self, address: &str) -> String {
        format!("{}:channel:seq:{}", self.prefix, address)
    }

    /// Returns the cached sequence while fresh, otherwise fetches from
    /// chain. The chain value is not written back; only a confirmed
    /// submission commits.
    pub async fn get_sequence(&self, address: &str) -> GatewayResult<i64> {
        let key = self.seq_key(address);
        match get_typed::<SequenceDoc>(self.kv.as_ref(), &key).await {
            Ok(Some(doc)) => {
                let age = epoch_ms().saturating_sub(doc.stored_at);
                if age < self.max_age.as_millis() as u64 {
                    if let Ok(sequence) = doc.sequence.parse::<i64>() {
                        trace!(
                            "Using cached sequence {} for {} (age {} ms)",
                            sequence,
                            address,
                            age
                        );
                        return Ok(sequence);
                    }
                    warn!(
                        "Cached sequence for {} is not a number, refetching",
                        address
                    );
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to read cached sequence: {:?}", err);
            }
        }
        self.fetch_from_chain(address).await
    }

    /// Remembers that `used` was consumed by a confirmed transaction, so
    /// the next holder starts at `used + 1`. Errors are logged and
    /// swallowed; a lost commit only costs a chain fetch.
    pub async fn commit_sequence(&self, address: &str, used: i64) {
        let doc = SequenceDoc {
            sequence: (used + 1).to_string(),
            stored_at: epoch_ms(),
        };
        if let Err(err) =
            set_typed(self.kv.as_ref(), &self.seq_key(address), &doc, None)
                .await
        {
            warn!(
                "Failed to commit sequence for {}: {:?}",
                address, err
            );
        }
    }

    /// Drops the cached entry after a non-confirmed outcome; the next
    /// request falls back to the chain. Errors are swallowed.
    pub async fn clear_sequence(&self, address: &str) {
        if let Err(err) = self.kv.del(&self.seq_key(address)).await {
            warn!("Failed to clear sequence for {}: {:?}", address, err);
        }
    }

    async fn fetch_from_chain(&self, address: &str) -> GatewayResult<i64> {
        let key = account_ledger_key(address).map_err(|err| {
            GatewayError::new(
                ErrorCode::FailedToGetSequence,
                format!("cannot build account ledger key: {}", err),
            )
        })?;

        let response = self
            .rpc
            .get_ledger_entries(&[key])
            .await
            .map_err(|err| {
                GatewayError::new(
                    ErrorCode::FailedToGetSequence,
                    format!("getLedgerEntries failed: {}", err),
                )
            })?;

        let entry = response
            .entries
            .as_deref()
            .and_then(|entries| entries.first())
            .ok_or_else(|| {
                GatewayError::new(
                    ErrorCode::AccountNotFound,
                    format!("account {} not found on chain", address),
                )
            })?;

        let current =
            account_sequence_from_entry(&entry.xdr).map_err(|err| {
                GatewayError::new(
                    ErrorCode::FailedToGetSequence,
                    format!("cannot decode account entry: {}", err),
                )
            })?;
        // The ledger reports the last consumed sequence; the next
        // transaction uses the one after it.
        Ok(current + 1)
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
