use std::{sync::Arc, time::Duration};

use log::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

use lumen_kv::{get_typed, set_typed, with_lock, KvStore, OnBusy};

use crate::error::{ErrorCode, GatewayError, GatewayResult};

const RECORD_LOCK_TTL: Duration = Duration::from_secs(3);
const RECORD_RETRIES: u32 = 3;
const RECORD_RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct UsageDoc {
    #[serde(default)]
    consumed: i64,
    #[serde(rename = "periodStart", skip_serializing_if = "Option::is_none")]
    period_start: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LimitDoc {
    limit: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub consumed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<u64>,
}

/// Per-API-key fee budget state over the shared KV store.
///
/// The budget gate (`check_budget`) is a blocking read; usage recording is
/// strictly non-blocking: it retries a contended lock a few times and then
/// gives up with a warning rather than failing the submission that already
/// happened.
pub struct FeeTracker {
    kv: Arc<dyn KvStore>,
    prefix: String,
    api_key: String,
    default_limit: Option<i64>,
    reset_period: Option<Duration>,
}

impl FeeTracker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        network_prefix: impl Into<String>,
        api_key: impl Into<String>,
        default_limit: Option<i64>,
        reset_period: Option<Duration>,
    ) -> Self {
        Self {
            kv,
            prefix: network_prefix.into(),
            api_key: api_key.into(),
            default_limit,
            reset_period,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    fn usage_key(&self) -> String {
        format!("{}:api-key-fees:{}", self.prefix, self.api_key)
    }

    fn limit_key(&self) -> String {
        format!("{}:api-key-limit:{}", self.prefix, self.api_key)
    }

    // -----------------
    // Budget gate
    // -----------------

    /// Custom per-key limit if set, else the configured default.
    pub async fn effective_limit(&self) -> GatewayResult<Option<i64>> {
        Ok(self.get_custom_limit().await?.or(self.default_limit))
    }

    /// Passes iff `consumed + fee ≤ limit`, or no limit applies.
    pub async fn check_budget(&self, fee: i64) -> GatewayResult<()> {
        let Some(limit) = self.effective_limit().await? else {
            return Ok(());
        };

        let state = self.read_usage().await?;
        if state.consumed + fee > limit {
            let remaining = (limit - state.consumed).max(0);
            return Err(GatewayError::with_details(
                ErrorCode::FeeLimitExceeded,
                format!(
                    "fee budget exhausted for api key: {} of {} stroops \
                     remaining, transaction needs {}",
                    remaining, limit, fee
                ),
                json!({
                    "consumed": state.consumed,
                    "fee": fee,
                    "remaining": remaining,
                    "limit": limit,
                }),
            ));
        }
        Ok(())
    }

    // -----------------
    // Usage recording
    // -----------------

    /// Adds `fee` to the key's consumption under a scoped lock. Never
    /// fails: lock contention past the retry budget and KV errors are
    /// logged and swallowed so a settled submission is not broken by
    /// bookkeeping.
    pub async fn record_usage(&self, fee: i64) {
        let lock_key = format!("{}:lock", self.usage_key());

        for attempt in 0..RECORD_RETRIES {
            let outcome: Result<Option<()>, lumen_kv::KvError> = with_lock(
                self.kv.as_ref(),
                &lock_key,
                RECORD_LOCK_TTL,
                OnBusy::Skip,
                || self.record_usage_locked(fee),
            )
            .await;

            match outcome {
                Ok(Some(())) => return,
                Ok(None) => {
                    trace!(
                        "Usage lock for '{}' busy (attempt {})",
                        self.api_key,
                        attempt + 1
                    );
                    tokio::time::sleep(RECORD_RETRY_BACKOFF * (attempt + 1))
                        .await;
                }
                Err(err) => {
                    warn!(
                        "Failed to record fee usage for '{}': {:?}",
                        self.api_key, err
                    );
                    return;
                }
            }
        }
        warn!(
            "Gave up recording {} stroops for '{}' after {} contended \
             attempts",
            fee, self.api_key, RECORD_RETRIES
        );
    }

    async fn record_usage_locked(
        &self,
        fee: i64,
    ) -> Result<(), lumen_kv::KvError> {
        let state: UsageDoc =
            get_typed(self.kv.as_ref(), &self.usage_key())
                .await?
                .unwrap_or_default();
        let state = self.apply_period_expiry(state);

        let updated = UsageDoc {
            consumed: state.consumed.saturating_add(fee),
            period_start: state.period_start.or_else(|| Some(epoch_ms())),
        };
        set_typed(self.kv.as_ref(), &self.usage_key(), &updated, None).await
    }

    // -----------------
    // Introspection
    // -----------------

    pub async fn get_usage_info(&self) -> GatewayResult<UsageInfo> {
        let state = self.read_usage().await?;
        let limit = self.effective_limit().await?;
        let remaining =
            limit.map(|limit| (limit - state.consumed).max(0));
        let period_end = match (state.period_start, self.reset_period) {
            (Some(start), Some(period)) => {
                Some(start + period.as_millis() as u64)
            }
            _ => None,
        };
        Ok(UsageInfo {
            consumed: state.consumed,
            limit,
            remaining,
            period_start: state.period_start,
            period_end,
        })
    }

    async fn read_usage(&self) -> GatewayResult<UsageDoc> {
        let state: UsageDoc =
            get_typed(self.kv.as_ref(), &self.usage_key())
                .await?
                .unwrap_or_default();
        Ok(self.apply_period_expiry(state))
    }

    /// A usage document older than the reset period counts as brand new.
    /// The reset is applied on read; the stored document is rewritten the
    /// next time usage is recorded.
    fn apply_period_expiry(&self, state: UsageDoc) -> UsageDoc {
        let (Some(period), Some(start)) =
            (self.reset_period, state.period_start)
        else {
            return state;
        };
        if epoch_ms().saturating_sub(start) >= period.as_millis() as u64 {
            return UsageDoc::default();
        }
        state
    }

    // -----------------
    // Limit management
    // -----------------

    pub async fn get_custom_limit(&self) -> GatewayResult<Option<i64>> {
        let doc: Option<LimitDoc> =
            get_typed(self.kv.as_ref(), &self.limit_key()).await?;
        Ok(doc.map(|doc| doc.limit))
    }

    pub async fn set_custom_limit(&self, limit: i64) -> GatewayResult<()> {
        if limit < 0 {
            return Err(GatewayError::new(
                ErrorCode::InvalidPayload,
                "fee limit must be a non-negative integer",
            ));
        }
        set_typed(
            self.kv.as_ref(),
            &self.limit_key(),
            &LimitDoc { limit },
            None,
        )
        .await
        .map_err(GatewayError::from)
    }

    pub async fn delete_custom_limit(&self) -> GatewayResult<()> {
        self.kv
            .del(&self.limit_key())
            .await
            .map_err(GatewayError::from)
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
