use std::sync::Arc;

use log::*;
use serde::Deserialize;
use serde_json::{json, Value};

use lumen_channel_pool::{
    load_membership, normalize_ids, store_membership, ChannelPool,
    ChannelPoolConfig,
};
use lumen_kv::KvStore;

use crate::{
    config::Config,
    error::{ErrorCode, GatewayError, GatewayResult},
    fees::FeeTracker,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagementParams {
    #[serde(default)]
    admin_secret: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    relayer_ids: Option<Vec<String>>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// Admin-gated control surface: channel membership rewrites with
/// lock-conflict protection, per-key budget administration and pool
/// statistics.
pub async fn handle_management(
    kv: Arc<dyn KvStore>,
    config: &Config,
    management: &Value,
) -> GatewayResult<Value> {
    let params: ManagementParams =
        serde_json::from_value(management.clone()).map_err(|err| {
            GatewayError::new(
                ErrorCode::InvalidPayload,
                format!("malformed management request: {}", err),
            )
        })?;

    authorize(config, params.admin_secret.as_deref())?;

    let action = params.action.as_deref().unwrap_or_default();
    match action {
        "listChannelAccounts" => {
            let members =
                load_membership(kv.as_ref(), config.network.as_str())
                    .await?;
            Ok(json!({ "relayerIds": members }))
        }
        "setChannelAccounts" => {
            let raw = params.relayer_ids.ok_or_else(|| {
                GatewayError::new(
                    ErrorCode::InvalidPayload,
                    "'relayerIds' is required for setChannelAccounts",
                )
            })?;
            set_channel_accounts(kv, config, raw).await
        }
        "getFeeUsage" => {
            let tracker = tracker_for(kv, config, params.api_key)?;
            let info = tracker.get_usage_info().await?;
            Ok(serde_json::to_value(info).unwrap_or_default())
        }
        "getFeeLimit" => {
            let tracker = tracker_for(kv, config, params.api_key)?;
            let custom = tracker.get_custom_limit().await?;
            Ok(json!({
                "limit": custom,
                "effectiveLimit": custom.or(config.default_fee_limit),
            }))
        }
        "setFeeLimit" => {
            let limit = params.limit.ok_or_else(|| {
                GatewayError::new(
                    ErrorCode::InvalidPayload,
                    "'limit' is required for setFeeLimit",
                )
            })?;
            let tracker = tracker_for(kv, config, params.api_key)?;
            tracker.set_custom_limit(limit).await?;
            Ok(json!({ "limit": limit }))
        }
        "deleteFeeLimit" => {
            let tracker = tracker_for(kv, config, params.api_key)?;
            tracker.delete_custom_limit().await?;
            Ok(json!({ "deleted": true }))
        }
        "stats" => stats(kv, config).await,
        other => Err(GatewayError::new(
            ErrorCode::InvalidAction,
            format!("unknown management action '{}'", other),
        )),
    }
}

/// Both the configured and the provided secret must be non-empty, and
/// equal after trimming.
fn authorize(config: &Config, provided: Option<&str>) -> GatewayResult<()> {
    let Some(expected) = config
        .admin_secret
        .as_deref()
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
    else {
        return Err(GatewayError::new(
            ErrorCode::ManagementDisabled,
            "management plane is disabled: no admin secret configured",
        ));
    };

    let provided = provided.map(str::trim).unwrap_or_default();
    if provided.is_empty() || provided != expected {
        return Err(GatewayError::new(
            ErrorCode::Unauthorized,
            "invalid admin secret",
        ));
    }
    Ok(())
}

/// Rewrites the membership list. Ids being removed must not hold a live
/// lock: dropping a busy channel would orphan its in-flight request.
async fn set_channel_accounts(
    kv: Arc<dyn KvStore>,
    config: &Config,
    raw_ids: Vec<String>,
) -> GatewayResult<Value> {
    let new_ids = normalize_ids(&raw_ids)?;
    let current =
        load_membership(kv.as_ref(), config.network.as_str()).await?;
    let pool = pool_for(Arc::clone(&kv), config);

    let mut locked = Vec::new();
    for removed in current.iter().filter(|id| !new_ids.contains(id)) {
        if pool.is_locked(removed).await? {
            locked.push(removed.clone());
        }
    }
    if !locked.is_empty() {
        return Err(GatewayError::with_details(
            ErrorCode::LockedConflict,
            "cannot remove channel accounts that are currently locked",
            json!({ "locked": locked }),
        ));
    }

    store_membership(kv.as_ref(), config.network.as_str(), new_ids.clone())
        .await?;
    info!(
        "Channel membership updated: {} member(s) on {}",
        new_ids.len(),
        config.network.as_str()
    );
    Ok(json!({ "relayerIds": new_ids }))
}

async fn stats(
    kv: Arc<dyn KvStore>,
    config: &Config,
) -> GatewayResult<Value> {
    let members =
        load_membership(kv.as_ref(), config.network.as_str()).await?;
    let pool = pool_for(Arc::clone(&kv), config);

    // Lock probing is best-effort; a flaky backend should not break stats.
    let (locked, available) = match pool.locked_channels().await {
        Ok(locked) => {
            let available = members
                .iter()
                .filter(|id| !locked.contains(id))
                .count();
            (Some(locked.len()), Some(available))
        }
        Err(err) => {
            warn!("Failed to probe channel locks for stats: {:?}", err);
            (None, None)
        }
    };

    Ok(json!({
        "network": config.network.as_str(),
        "poolSize": members.len(),
        "locked": locked,
        "available": available,
        "lockTtlSeconds": config.lock_ttl.as_secs(),
        "capacityRatio": config.capacity_ratio,
        "limitedContracts": config
            .limited_contracts
            .iter()
            .cloned()
            .collect::<Vec<_>>(),
        "inclusionFeeDefault": config.inclusion_fee_default,
        "inclusionFeeLimited": config.inclusion_fee_limited,
        "defaultFeeLimit": config.default_fee_limit,
        "feeResetPeriodSeconds": config
            .fee_reset_period
            .map(|period| period.as_secs()),
    }))
}

fn pool_for(kv: Arc<dyn KvStore>, config: &Config) -> ChannelPool {
    ChannelPool::new(
        kv,
        config.network.as_str(),
        ChannelPoolConfig {
            lock_ttl: config.lock_ttl,
            capacity_ratio: config.capacity_ratio,
            limited_contracts: config.limited_contracts.clone(),
        },
    )
}

fn tracker_for(
    kv: Arc<dyn KvStore>,
    config: &Config,
    api_key: Option<String>,
) -> GatewayResult<FeeTracker> {
    let api_key = api_key
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| {
            GatewayError::new(
                ErrorCode::InvalidPayload,
                "'apiKey' is required for this action",
            )
        })?;
    Ok(FeeTracker::new(
        kv,
        config.network.as_str(),
        api_key,
        config.default_fee_limit,
        config.fee_reset_period,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;
    use lumen_kv::MemoryKv;

    fn admin_config() -> Config {
        let mut config = test_config();
        config.admin_secret = Some("hunter2".to_string());
        config
    }

    fn request(action: &str, extra: Value) -> Value {
        let mut body = json!({
            "adminSecret": "hunter2",
            "action": action,
        });
        if let (Some(body), Some(extra)) =
            (body.as_object_mut(), extra.as_object())
        {
            for (key, value) in extra {
                body.insert(key.clone(), value.clone());
            }
        }
        body
    }

    #[tokio::test]
    async fn disabled_without_admin_secret() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = test_config();
        let err = handle_management(
            kv,
            &config,
            &request("listChannelAccounts", json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ManagementDisabled);
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();
        let err = handle_management(
            kv,
            &config,
            &json!({ "adminSecret": "nope", "action": "stats" }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unauthorized);
        assert_eq!(err.status, 401);
    }

    #[tokio::test]
    async fn secret_comparison_trims_whitespace() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();
        let data = handle_management(
            kv,
            &config,
            &json!({
                "adminSecret": "  hunter2  ",
                "action": "listChannelAccounts",
            }),
        )
        .await
        .unwrap();
        assert_eq!(data["relayerIds"], json!([]));
    }

    #[tokio::test]
    async fn set_and_list_channel_accounts() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();

        let data = handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": [" P1 ", "p2", "p1"] }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(data["relayerIds"], json!(["p1", "p2"]));

        let data = handle_management(
            kv,
            &config,
            &request("listChannelAccounts", json!({})),
        )
        .await
        .unwrap();
        assert_eq!(data["relayerIds"], json!(["p1", "p2"]));
    }

    #[tokio::test]
    async fn invalid_relayer_id_is_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();
        let err = handle_management(
            kv,
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["white space"] }),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn removing_a_locked_channel_conflicts() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();

        handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1", "p2"] }),
            ),
        )
        .await
        .unwrap();

        // p2 is serving a request.
        let pool = pool_for(Arc::clone(&kv), &config);
        let lease = loop {
            let lease = pool.acquire(None).await.unwrap();
            if lease.relayer_id == "p2" {
                break lease;
            }
            pool.release(&lease).await;
        };

        let err = handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1"] }),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::LockedConflict);
        assert_eq!(err.status, 409);
        assert_eq!(err.details.unwrap()["locked"], json!(["p2"]));

        // Once released, the rewrite goes through.
        pool.release(&lease).await;
        handle_management(
            kv,
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1"] }),
            ),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn keeping_a_locked_channel_is_fine() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();

        handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1"] }),
            ),
        )
        .await
        .unwrap();

        let pool = pool_for(Arc::clone(&kv), &config);
        let _lease = pool.acquire(None).await.unwrap();

        // p1 stays a member, so its lock is not a conflict.
        handle_management(
            kv,
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1", "p3"] }),
            ),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fee_limit_roundtrip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();

        let data = handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setFeeLimit",
                json!({ "apiKey": "key-9", "limit": 5_000 }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(data["limit"], 5_000);

        let data = handle_management(
            Arc::clone(&kv),
            &config,
            &request("getFeeLimit", json!({ "apiKey": "key-9" })),
        )
        .await
        .unwrap();
        assert_eq!(data["limit"], 5_000);

        handle_management(
            Arc::clone(&kv),
            &config,
            &request("deleteFeeLimit", json!({ "apiKey": "key-9" })),
        )
        .await
        .unwrap();

        let data = handle_management(
            kv,
            &config,
            &request("getFeeLimit", json!({ "apiKey": "key-9" })),
        )
        .await
        .unwrap();
        assert_eq!(data["limit"], Value::Null);
    }

    #[tokio::test]
    async fn fee_usage_requires_api_key() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();
        let err = handle_management(
            kv,
            &config,
            &request("getFeeUsage", json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn stats_reports_pool_shape() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();

        handle_management(
            Arc::clone(&kv),
            &config,
            &request(
                "setChannelAccounts",
                json!({ "relayerIds": ["p1", "p2", "p3"] }),
            ),
        )
        .await
        .unwrap();
        let pool = pool_for(Arc::clone(&kv), &config);
        let _lease = pool.acquire(None).await.unwrap();

        let data =
            handle_management(kv, &config, &request("stats", json!({})))
                .await
                .unwrap();
        assert_eq!(data["poolSize"], 3);
        assert_eq!(data["locked"], 1);
        assert_eq!(data["available"], 2);
        assert_eq!(data["inclusionFeeDefault"], 203);
        assert_eq!(data["network"], "testnet");
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let config = admin_config();
        let err = handle_management(
            kv,
            &config,
            &request("selfDestruct", json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidAction);
    }
}
