//! Startup wiring: brings the coordinator from configuration to a running driver.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::coordinator::Coordinator;
use crate::ledger::Ledger;
use crate::metrics::Metrics;
use crate::role::Role;

/// Resolve our role, subscribe to the ledger, catch up on missed requests and
/// start the coordinator driver.
///
/// The returned handle resolves only if the driver stops, which is always an error.
pub async fn start_watching(
    config: AppConfig,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
) -> Result<(Arc<Coordinator>, JoinHandle<Result<()>>)> {
    load_libs(&config, ledger.as_ref()).await?;
    let events = ledger.subscribe().await?;

    for aa in &config.consumer_aas {
        ledger.follow(aa).await?;
    }
    let operator = ledger.operator_address();
    let role = Role::resolve(ledger.as_ref(), &config.vrf_oracle_aa, &operator).await?;
    for address in &config.attestors {
        ledger.watch_address(address).await?;
    }
    init_consumers(&config, ledger.as_ref()).await?;

    let (coordinator, driver) = Coordinator::new(ledger, clock, config, role, metrics);
    let found = coordinator.reconcile().await?;
    info!(%operator, found, "Watching randomness consumers");

    let handle = tokio::spawn(driver.run(events));
    Ok((coordinator, handle))
}

/// Make library contracts available to local getter evaluation.
async fn load_libs(config: &AppConfig, ledger: &dyn Ledger) -> Result<()> {
    for aa in &config.lib_aas {
        let definition = ledger
            .read_definition(aa)
            .await
            .with_context(|| format!("failed to read definition of {aa}"))?;
        ledger.insert_definition(aa, &definition).await?;
    }
    Ok(())
}

/// Request history for the asset of every consumer.
async fn init_consumers(config: &AppConfig, ledger: &dyn Ledger) -> Result<()> {
    let mut assets = Vec::new();
    for aa in &config.consumer_aas {
        let vars = ledger.get_state_vars(aa).await?;
        let asset = vars
            .get("constants")
            .and_then(|c| c.get("asset"))
            .and_then(Value::as_str)
            .with_context(|| format!("asset not defined yet in {aa}"))?;
        assets.push(asset.to_string());
    }
    ledger.request_history(&assets).await
}
