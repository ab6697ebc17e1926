//! Determines, once at startup, whether this process is the finishing provider.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::ledger::{Address, Ledger};

#[derive(Debug, Deserialize)]
struct OracleDefinition {
    params: OracleParams,
}

#[derive(Debug, Deserialize)]
struct OracleParams {
    vrf_providers: BTreeMap<Address, Value>,
    finishing_provider: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Aggregates peers' proofs and submits the final one.
    Finishing { peers: HashSet<Address> },
    /// Posts its own proof as soon as it sees a request.
    NonFinishing,
}

impl Role {
    /// Read the oracle's provider configuration and place `operator` in it.
    pub async fn resolve(ledger: &dyn Ledger, oracle: &Address, operator: &Address) -> Result<Self> {
        ledger.follow(oracle).await?;
        let definition = ledger
            .load(oracle)
            .await
            .with_context(|| format!("failed to load oracle {oracle}"))?;
        let role = Self::from_definition(definition, oracle, operator)?;
        match &role {
            Role::Finishing { peers } => {
                info!(%oracle, peers = peers.len(), "Acting as finishing provider")
            }
            Role::NonFinishing => info!(%oracle, "Acting as non-finishing provider"),
        }
        Ok(role)
    }

    fn from_definition(definition: Value, oracle: &Address, operator: &Address) -> Result<Self> {
        let OracleDefinition { params } = serde_json::from_value(definition)
            .with_context(|| format!("oracle {oracle} has no provider params"))?;

        if !params.vrf_providers.contains_key(operator) {
            bail!("{operator} is not a member of VRF oracle {oracle}");
        }
        if *operator != params.finishing_provider {
            return Ok(Role::NonFinishing);
        }
        let peers = params
            .vrf_providers
            .into_keys()
            .filter(|a| *a != params.finishing_provider)
            .collect();
        Ok(Role::Finishing { peers })
    }

    pub fn is_finishing(&self) -> bool {
        matches!(self, Role::Finishing { .. })
    }

    /// Number of peer proofs that make a quorum.
    pub fn required(&self) -> usize {
        match self {
            Role::Finishing { peers } => peers.len(),
            Role::NonFinishing => 0,
        }
    }

    pub fn is_peer(&self, address: &Address) -> bool {
        match self {
            Role::Finishing { peers } => peers.contains(address),
            Role::NonFinishing => false,
        }
    }
}
