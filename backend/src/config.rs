//! Application configuration loaded from environment variables.
//!
//! All optional: `LEDGER_RPC_URL`, `TESTNET`, `VRF_ORACLE_AA`, `CONSUMER_AAS`,
//! `LIB_AAS`, `ATTESTORS`, `PROOF_KEY_PATH`, `FINISHING_PROVIDER_TIMEOUT_SECS`,
//! `DEADLINE_MARGIN_SECS`, `RECONCILE_INTERVAL_SECS`, `EVENT_POLL_INTERVAL_MS`,
//! `HTTP_PORT`. List values are comma-separated.

use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::ledger::Address;
use crate::policy::GracePeriod;

const DEFAULT_ORACLE_AA: &str = "R2OVZFLVPBY65CNRL4W6GKK34XGOOQJS";
const DEFAULT_LIB_AAS: &[&str] = &["3LUPAHCQMJCQDKFVZB7GFKYJMHZ5BC67"];
const MAINNET_CONSUMER_AAS: &[&str] = &["CITYC3WWO5DD2UM6HQR3H333RRTD253Q"];
const TESTNET_CONSUMER_AAS: &[&str] = &["XUXPOHYSH6PHQBTM32ZIJX3RHWBJHX4L"];
const MAINNET_ATTESTORS: &[&str] = &[
    "JBW7HT5CRBSF7J7RD26AYLQG6GZDPFPS", // telegram
    "5KM36CFPBD2QJLVD65PHZG34WEM4RPY2", // discord
];
const TESTNET_ATTESTORS: &[&str] = &["EJC4A7WQGHEZEKW6RLO7F26SAR4LAQBU"];

/// Application configuration for the VRF oracle coordinator.
#[derive(Clone)]
pub struct AppConfig {
    /// Ledger runtime JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// The shared VRF oracle contract.
    pub vrf_oracle_aa: Address,
    /// Consumer contracts whose randomness requests we serve.
    pub consumer_aas: Vec<Address>,
    /// Library contracts the consumers' getters depend on.
    pub lib_aas: Vec<Address>,
    /// Attestor addresses to watch.
    pub attestors: Vec<Address>,
    /// Key used to compute proofs.
    pub proof_key: Arc<Vec<u8>>,
    /// How long the finishing provider waits for its peers.
    pub grace_period: GracePeriod,
    /// Interval between reconciliation sweeps.
    pub reconcile_interval: Duration,
    /// Event feed polling interval.
    pub event_poll_interval: Duration,
    /// HTTP server port.
    pub http_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            std::env::var("LEDGER_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:6612".into());
        let testnet = std::env::var("TESTNET").is_ok_and(|v| !v.is_empty() && v != "0");

        let vrf_oracle_aa = std::env::var("VRF_ORACLE_AA")
            .map(Address::new)
            .unwrap_or_else(|_| DEFAULT_ORACLE_AA.into());

        let consumer_aas = address_list(
            "CONSUMER_AAS",
            if testnet { TESTNET_CONSUMER_AAS } else { MAINNET_CONSUMER_AAS },
        );
        let lib_aas = address_list("LIB_AAS", DEFAULT_LIB_AAS);
        let attestors = address_list(
            "ATTESTORS",
            if testnet { TESTNET_ATTESTORS } else { MAINNET_ATTESTORS },
        );

        let key_path = std::env::var("PROOF_KEY_PATH")
            .unwrap_or_else(|_| "~/.config/vrf-oracle/privkey.pem".into());
        let key_path = shellexpand::tilde(&key_path).to_string();
        let proof_key = std::fs::read(&key_path)
            .with_context(|| format!("failed to read proof key from {key_path}"))?;

        let grace_period = GracePeriod {
            timeout: Duration::from_secs(env_or("FINISHING_PROVIDER_TIMEOUT_SECS", 600)?),
            margin: Duration::from_secs(env_or("DEADLINE_MARGIN_SECS", 30)?),
        };
        let reconcile_interval = Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", 3 * 3600)?);
        let event_poll_interval = Duration::from_millis(env_or("EVENT_POLL_INTERVAL_MS", 1000)?);
        let http_port = env_or("HTTP_PORT", 8080)?;

        Ok(Self {
            rpc_url,
            vrf_oracle_aa,
            consumer_aas,
            lib_aas,
            attestors,
            proof_key: Arc::new(proof_key),
            grace_period,
            reconcile_interval,
            event_poll_interval,
            http_port,
        })
    }

    pub fn is_consumer(&self, aa: &Address) -> bool {
        self.consumer_aas.contains(aa)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(v) => v.trim().parse().with_context(|| format!("invalid {name}: {v}")),
        Err(_) => Ok(default),
    }
}

fn address_list(name: &str, defaults: &[&str]) -> Vec<Address> {
    match std::env::var(name) {
        Ok(v) => parse_list(&v),
        Err(_) => defaults.iter().map(|a| Address::from(*a)).collect(),
    }
}

fn parse_list(value: &str) -> Vec<Address> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Address::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_trimmed_and_skips_empty_items() {
        assert_eq!(
            parse_list(" A , B,,C ,"),
            vec![Address::from("A"), Address::from("B"), Address::from("C")]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn missing_numeric_var_uses_default() {
        let v: u64 = env_or("VRF_ORACLE_TEST_SURELY_UNSET_VAR", 42).unwrap();
        assert_eq!(v, 42);
    }
}
