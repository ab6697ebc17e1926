//! Boundary with the ledger runtime.
//!
//! Everything the coordinator needs from the outside world (contract state,
//! getter evaluation, transaction submission, the event feed) goes through the
//! [`Ledger`] trait. The production implementation is [`crate::rpc::RpcLedger`];
//! tests use an in-memory fake.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::{OwnedMutexGuard, mpsc};

/// Ledger address of an account or contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// State variables of a single contract, keyed by variable name.
pub type StateVars = Map<String, Value>;

/// Held while reading upcoming (not yet stable) contract state.
pub type UpcomingStateGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub app: String,
    #[serde(default)]
    pub payload: Value,
}

/// A ledger unit (transaction) as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit: String,
    pub authors: Vec<Author>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub timestamp: u64,
}

impl Unit {
    /// Address of the first author, i.e. whoever triggered the contract.
    pub fn trigger_address(&self) -> Option<&Address> {
        self.authors.first().map(|a| &a.address)
    }

    /// Payload of the unit's `data` message, if any.
    pub fn trigger_data(&self) -> Option<&Map<String, Value>> {
        self.messages
            .iter()
            .find(|m| m.app == "data")
            .and_then(|m| m.payload.as_object())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "responseVars")]
    pub response_vars: Option<Map<String, Value>>,
}

/// A contract response recorded on the ledger (possibly bounced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaResponse {
    pub aa_address: Address,
    pub trigger_unit: String,
    pub trigger_address: Address,
    #[serde(default)]
    pub bounced: bool,
    #[serde(default)]
    pub response: ResponseBody,
    pub timestamp: u64,
}

/// Notification pushed by the ledger runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// A trigger unit was executed by one or more contracts.
    RequestApplied { unit: Unit, responses: Vec<AaResponse> },
    /// A single contract response was recorded.
    ResponseApplied { response: AaResponse },
}

/// Upcoming state captured for a getter evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub state_vars: Value,
    pub balances: Value,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Address this process signs transactions with.
    fn operator_address(&self) -> Address;

    /// Start tracking a contract's state (stable and upcoming).
    async fn follow(&self, aa: &Address) -> Result<()>;

    /// Stable state variables of a followed contract.
    async fn get_state_vars(&self, aa: &Address) -> Result<StateVars>;

    /// Exclusive access to the upcoming state.
    async fn lock_upcoming_state(&self) -> UpcomingStateGuard;

    async fn get_upcoming_state_vars(&self) -> Result<Value>;

    async fn get_upcoming_balances(&self) -> Result<Value>;

    /// Evaluate a read-only getter against `snapshot`.
    async fn evaluate_getter(
        &self,
        aa: &Address,
        getter: &str,
        args: &[Value],
        snapshot: &StateSnapshot,
    ) -> Result<Value>;

    /// Send a data request to a contract. `Ok(None)` means no unit was composed.
    async fn submit_request(&self, aa: &Address, payload: &Value) -> Result<Option<String>>;

    async fn read_unit(&self, unit: &str) -> Result<Unit>;

    /// Feed a just-sent request into the upcoming-state tracker.
    async fn apply_upcoming_request(&self, unit: &Unit, aa: &Address) -> Result<()>;

    async fn read_definition(&self, aa: &Address) -> Result<Value>;

    /// Load a contract definition into local storage and return it.
    async fn load(&self, aa: &Address) -> Result<Value>;

    async fn insert_definition(&self, aa: &Address, definition: &Value) -> Result<()>;

    async fn watch_address(&self, address: &Address) -> Result<()>;

    /// Ask the hub for the transaction history of the given assets.
    async fn request_history(&self, assets: &[String]) -> Result<()>;

    /// Subscribe to applied requests and responses.
    async fn subscribe(&self) -> Result<mpsc::Receiver<LedgerEvent>>;
}
