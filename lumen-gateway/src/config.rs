use std::{collections::HashSet, time::Duration};

use log::*;

use lumen_rpc_client::{
    MAINNET_PASSPHRASE, MAINNET_RPC_URL, TESTNET_PASSPHRASE, TESTNET_RPC_URL,
};

use crate::error::{ErrorCode, GatewayError, GatewayResult};

pub const DEFAULT_LOCK_TTL_SECONDS: u64 = 30;
pub const MIN_LOCK_TTL_SECONDS: u64 = 3;
pub const MAX_LOCK_TTL_SECONDS: u64 = 30;
pub const DEFAULT_CAPACITY_RATIO: f64 = 0.8;
pub const DEFAULT_INCLUSION_FEE: i64 = 203;
pub const DEFAULT_INCLUSION_FEE_LIMITED: i64 = 201;
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
pub const DEFAULT_SEQUENCE_MAX_AGE_MS: u64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "testnet" => Some(Network::Testnet),
            "mainnet" => Some(Network::Mainnet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    pub fn passphrase(&self) -> &'static str {
        match self {
            Network::Testnet => TESTNET_PASSPHRASE,
            Network::Mainnet => MAINNET_PASSPHRASE,
        }
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::Testnet => TESTNET_RPC_URL,
            Network::Mainnet => MAINNET_RPC_URL,
        }
    }
}

/// Per-request configuration snapshot, parsed from the process environment.
/// Invalid optional values fall back to their defaults; only the required
/// variables fail the request.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub fund_relayer_id: String,
    pub lock_ttl: Duration,
    pub default_fee_limit: Option<i64>,
    pub fee_reset_period: Option<Duration>,
    pub api_key_header: String,
    pub admin_secret: Option<String>,
    pub limited_contracts: HashSet<String>,
    pub capacity_ratio: f64,
    pub inclusion_fee_default: i64,
    pub inclusion_fee_limited: i64,
    pub rpc_url: String,
    pub sequence_max_age: Duration,
}

impl Config {
    pub fn from_env() -> GatewayResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(
        var: impl Fn(&str) -> Option<String>,
    ) -> GatewayResult<Self> {
        let network_raw = required(&var, "NETWORK")?;
        let network =
            Network::parse(&network_raw).ok_or_else(|| {
                GatewayError::new(
                    ErrorCode::UnsupportedNetwork,
                    format!("unsupported network '{}'", network_raw),
                )
            })?;
        let fund_relayer_id = required(&var, "FUND_RELAYER_ID")?;

        let lock_ttl_secs = parse_or(&var, "LOCK_TTL_SECONDS", DEFAULT_LOCK_TTL_SECONDS)
            .clamp(MIN_LOCK_TTL_SECONDS, MAX_LOCK_TTL_SECONDS);

        let default_fee_limit = parse_opt::<i64>(&var, "FEE_LIMIT")
            .filter(|limit| *limit >= 0);

        let fee_reset_period = parse_opt::<u64>(&var, "FEE_RESET_PERIOD_SECONDS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let api_key_header = var("API_KEY_HEADER")
            .map(|raw| raw.trim().to_lowercase())
            .filter(|header| !header.is_empty())
            .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string());

        let admin_secret = var("PLUGIN_ADMIN_SECRET")
            .map(|raw| raw.trim().to_string())
            .filter(|secret| !secret.is_empty());

        let limited_contracts = var("LIMITED_CONTRACTS")
            .map(|raw| parse_limited_contracts(&raw))
            .unwrap_or_default();

        let capacity_ratio = parse_opt::<f64>(&var, "CONTRACT_CAPACITY_RATIO")
            .filter(|ratio| (0.0..=1.0).contains(ratio))
            .unwrap_or(DEFAULT_CAPACITY_RATIO);

        let inclusion_fee_default =
            parse_or(&var, "INCLUSION_FEE_DEFAULT", DEFAULT_INCLUSION_FEE);
        let inclusion_fee_limited = parse_or(
            &var,
            "INCLUSION_FEE_LIMITED",
            DEFAULT_INCLUSION_FEE_LIMITED,
        );

        let rpc_url = var("SOROBAN_RPC_URL")
            .map(|raw| raw.trim().to_string())
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| network.default_rpc_url().to_string());

        let sequence_max_age = Duration::from_millis(parse_or(
            &var,
            "SEQ_MAX_AGE_MS",
            DEFAULT_SEQUENCE_MAX_AGE_MS,
        ));

        Ok(Self {
            network,
            fund_relayer_id,
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            default_fee_limit,
            fee_reset_period,
            api_key_header,
            admin_secret,
            limited_contracts,
            capacity_ratio,
            inclusion_fee_default,
            inclusion_fee_limited,
            rpc_url,
            sequence_max_age,
        })
    }
}

fn required(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> GatewayResult<String> {
    var(name)
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            GatewayError::new(
                ErrorCode::ConfigMissing,
                format!("missing required environment variable {}", name),
            )
        })
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> T {
    parse_opt(var, name).unwrap_or(default)
}

fn parse_opt<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = var(name)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value '{}' for {}", raw, name);
            None
        }
    }
}

/// Comma-separated contract ids, upper-cased and strkey-validated.
/// Entries that do not parse as `C...` contract ids are dropped.
fn parse_limited_contracts(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|entry| entry.trim().to_uppercase())
        .filter(|entry| !entry.is_empty())
        .filter(|entry| {
            let valid =
                stellar_strkey::Contract::from_string(entry).is_ok();
            if !valid {
                warn!("Ignoring invalid limited contract id '{}'", entry);
            }
            valid
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config_from(pairs: &[(&str, &str)]) -> GatewayResult<Config> {
        let map = vars(pairs);
        Config::from_vars(move |name| map.get(name).cloned())
    }

    const CONTRACT: &str =
        "CA3D5KRYM6CB7OWQ6TWYRR3Z4T7GNZLKERYNZGGA5SOAOPIFY6YQGAXE";

    #[test]
    fn minimal_config_uses_defaults() {
        let config = config_from(&[
            ("NETWORK", "testnet"),
            ("FUND_RELAYER_ID", "fund"),
        ])
        .unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
        assert_eq!(config.default_fee_limit, None);
        assert_eq!(config.fee_reset_period, None);
        assert_eq!(config.api_key_header, "x-api-key");
        assert_eq!(config.capacity_ratio, DEFAULT_CAPACITY_RATIO);
        assert_eq!(config.inclusion_fee_default, 203);
        assert_eq!(config.inclusion_fee_limited, 201);
        assert!(config.limited_contracts.is_empty());
        assert_eq!(config.rpc_url, TESTNET_RPC_URL);
    }

    #[test]
    fn missing_required_fails_fast() {
        let err = config_from(&[("NETWORK", "testnet")]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissing);
        assert_eq!(err.status, 500);
    }

    #[test]
    fn unknown_network_is_rejected() {
        let err = config_from(&[
            ("NETWORK", "futurenet"),
            ("FUND_RELAYER_ID", "fund"),
        ])
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedNetwork);
    }

    #[test]
    fn lock_ttl_is_clamped() {
        let config = config_from(&[
            ("NETWORK", "testnet"),
            ("FUND_RELAYER_ID", "fund"),
            ("LOCK_TTL_SECONDS", "1"),
        ])
        .unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(3));

        let config = config_from(&[
            ("NETWORK", "testnet"),
            ("FUND_RELAYER_ID", "fund"),
            ("LOCK_TTL_SECONDS", "300"),
        ])
        .unwrap();
        assert_eq!(config.lock_ttl, Duration::from_secs(30));
    }

    #[test]
    fn invalid_optionals_fall_back() {
        let config = config_from(&[
            ("NETWORK", "mainnet"),
            ("FUND_RELAYER_ID", "fund"),
            ("FEE_LIMIT", "not-a-number"),
            ("CONTRACT_CAPACITY_RATIO", "7.5"),
            ("INCLUSION_FEE_DEFAULT", ""),
        ])
        .unwrap();
        assert_eq!(config.default_fee_limit, None);
        assert_eq!(config.capacity_ratio, DEFAULT_CAPACITY_RATIO);
        assert_eq!(config.inclusion_fee_default, 203);
        assert_eq!(config.rpc_url, MAINNET_RPC_URL);
    }

    #[test]
    fn limited_contracts_validate_and_uppercase() {
        let config = config_from(&[
            ("NETWORK", "testnet"),
            ("FUND_RELAYER_ID", "fund"),
            (
                "LIMITED_CONTRACTS",
                &format!(" {} , nonsense, ", CONTRACT.to_lowercase()),
            ),
        ])
        .unwrap();
        assert_eq!(config.limited_contracts.len(), 1);
        assert!(config.limited_contracts.contains(CONTRACT));
    }

    #[test]
    fn fee_settings_parse() {
        let config = config_from(&[
            ("NETWORK", "testnet"),
            ("FUND_RELAYER_ID", "fund"),
            ("FEE_LIMIT", "10000"),
            ("FEE_RESET_PERIOD_SECONDS", "60"),
        ])
        .unwrap();
        assert_eq!(config.default_fee_limit, Some(10_000));
        assert_eq!(config.fee_reset_period, Some(Duration::from_secs(60)));
    }
}
