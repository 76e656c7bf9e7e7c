use serde::{Deserialize, Serialize};

use lumen_kv::{get_typed, set_typed, KvStore};

use crate::error::{PoolError, PoolResult};

/// Longest accepted relayer identifier after normalization.
pub const MAX_ID_LEN: usize = 128;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct MembershipDoc {
    #[serde(rename = "relayerIds", default)]
    pub relayer_ids: Vec<String>,
}

pub fn membership_key(prefix: &str) -> String {
    format!("{}:channel:relayer-ids", prefix)
}

/// Normalizes a relayer id: trimmed, lowercased, `[a-z0-9:_-]`, ≤128 chars.
pub fn normalize_id(raw: &str) -> PoolResult<String> {
    let id = raw.trim().to_lowercase();
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| {
            c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, ':' | '_' | '-')
        });
    if !valid {
        return Err(PoolError::InvalidRelayerId(raw.to_string()));
    }
    Ok(id)
}

/// Normalizes and deduplicates a membership list, preserving first-seen
/// order.
pub fn normalize_ids(raw: &[String]) -> PoolResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw {
        let id = normalize_id(id)?;
        if !out.contains(&id) {
            out.push(id);
        }
    }
    Ok(out)
}

pub async fn load_membership(
    kv: &dyn KvStore,
    prefix: &str,
) -> PoolResult<Vec<String>> {
    let doc: Option<MembershipDoc> =
        get_typed(kv, &membership_key(prefix)).await?;
    Ok(doc.map(|doc| doc.relayer_ids).unwrap_or_default())
}

pub async fn store_membership(
    kv: &dyn KvStore,
    prefix: &str,
    relayer_ids: Vec<String>,
) -> PoolResult<()> {
    set_typed(
        kv,
        &membership_key(prefix),
        &MembershipDoc { relayer_ids },
        None,
    )
    .await
    .map_err(PoolError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_kv::MemoryKv;

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_id("  Payer-1 ").unwrap(), "payer-1");
        assert_eq!(normalize_id("ns:worker_2").unwrap(), "ns:worker_2");
    }

    #[test]
    fn normalize_rejects_bad_ids() {
        assert!(normalize_id("").is_err());
        assert!(normalize_id("   ").is_err());
        assert!(normalize_id("has space").is_err());
        assert!(normalize_id("emoji🙂").is_err());
        assert!(normalize_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn normalize_ids_dedupes_preserving_order() {
        let raw = vec![
            "P2".to_string(),
            "p1".to_string(),
            " p2 ".to_string(),
            "p1".to_string(),
        ];
        assert_eq!(normalize_ids(&raw).unwrap(), vec!["p2", "p1"]);
    }

    #[tokio::test]
    async fn membership_roundtrips_through_kv() {
        let kv = MemoryKv::new();
        assert!(load_membership(&kv, "testnet").await.unwrap().is_empty());
        store_membership(
            &kv,
            "testnet",
            vec!["p1".to_string(), "p2".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(
            load_membership(&kv, "testnet").await.unwrap(),
            vec!["p1", "p2"]
        );
    }
}
