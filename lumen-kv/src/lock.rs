use std::{future::Future, time::Duration};

use log::*;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{get_typed, KvError, KvResult, KvStore};

/// What a scoped-lock caller wants when the key is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnBusy {
    /// Fail with [KvError::LockBusy].
    Throw,
    /// Return `None` without invoking the critical section.
    Skip,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockDoc {
    token: String,
    #[serde(rename = "lockedAt")]
    locked_at: u64,
}

/// Generates a 128-bit random token, hex encoded.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Runs `critical` while holding a lock on `key`.
///
/// The lock is claimed with [KvStore::set_if_absent] and carries `ttl` so a
/// crashed holder cannot wedge the key forever. Release happens on every
/// exit path and is best-effort: the key is deleted only while the stored
/// token still matches, so a release racing a TTL expiry plus re-acquire is
/// a no-op.
pub async fn with_lock<T, E, F, Fut>(
    kv: &dyn KvStore,
    key: &str,
    ttl: Duration,
    on_busy: OnBusy,
    critical: F,
) -> Result<Option<T>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<KvError>,
{
    let token = random_token();
    let doc = LockDoc {
        token: token.clone(),
        locked_at: epoch_ms(),
    };
    let doc = serde_json::to_value(&doc)
        .map_err(|err| KvError::Encode(key.to_string(), err))?;

    let acquired = kv.set_if_absent(key, doc, Some(ttl)).await?;
    if !acquired {
        return match on_busy {
            OnBusy::Skip => Ok(None),
            OnBusy::Throw => Err(KvError::LockBusy(key.to_string()).into()),
        };
    }

    let result = critical().await;
    release(kv, key, &token).await;
    result.map(Some)
}

/// Deletes `key` iff it still carries `token`. Errors are swallowed since
/// the TTL reclaims the key anyway.
async fn release(kv: &dyn KvStore, key: &str, token: &str) {
    let stored = match get_typed::<LockDoc>(kv, key).await {
        Ok(stored) => stored,
        Err(err) => {
            warn!("Failed to read lock '{}' during release: {:?}", key, err);
            return;
        }
    };
    let Some(stored) = stored else {
        return;
    };
    if stored.token != token {
        debug!("Lock '{}' changed owner before release, leaving it", key);
        return;
    }
    if let Err(err) = kv.del(key).await {
        warn!("Failed to release lock '{}': {:?}", key, err);
    }
}

pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
