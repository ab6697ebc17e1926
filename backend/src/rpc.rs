//! JSON-RPC client for the ledger runtime.
//!
//! The runtime (a light node with contract-state tracking) exposes its storage,
//! getter evaluation, wallet and event feed over JSON-RPC 2.0. Events are
//! pulled with a cursor-based `poll_events` call from a background task and
//! forwarded into the subscription channel; transport errors are retried after
//! a fixed delay.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::ledger::{Address, Ledger, LedgerEvent, StateSnapshot, StateVars, Unit, UpcomingStateGuard};

/// HTTP request timeout for ledger RPC calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before polling again after a failed `poll_events` call.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the event subscription channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'static str,
    params: T,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct PollEventsResult {
    events: Vec<LedgerEvent>,
    cursor: u64,
}

#[derive(Clone)]
struct RpcClient {
    rpc_url: String,
    http: reqwest::Client,
}

impl RpcClient {
    async fn call<T: DeserializeOwned>(&self, method: &'static str, params: Value) -> Result<T> {
        self.call_optional(method, params)
            .await?
            .with_context(|| format!("ledger RPC {method} returned null result without error"))
    }

    /// Like [`RpcClient::call`] for methods whose result may legitimately be null.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: "1",
            method,
            params,
        };

        let resp: JsonRpcResponse<T> = self
            .http
            .post(&self.rpc_url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("ledger RPC {method} request failed"))?
            .json()
            .await
            .with_context(|| format!("failed to parse ledger RPC {method} response"))?;

        if let Some(err) = resp.error {
            anyhow::bail!("ledger RPC {method} error {}: {}", err.code, err.message);
        }
        Ok(resp.result)
    }
}

/// [`Ledger`] backed by the runtime's JSON-RPC endpoint.
pub struct RpcLedger {
    client: RpcClient,
    operator: Address,
    upcoming: Arc<Mutex<()>>,
    poll_interval: Duration,
}

impl RpcLedger {
    /// Connect to the runtime and fetch the operator address.
    pub async fn connect(rpc_url: &str, poll_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let client = RpcClient {
            rpc_url: rpc_url.to_string(),
            http,
        };
        let operator: Address = client.call("get_operator_address", json!({})).await?;
        info!(%operator, rpc = %rpc_url, "Connected to ledger runtime");

        Ok(Self {
            client,
            operator,
            upcoming: Arc::new(Mutex::new(())),
            poll_interval,
        })
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    fn operator_address(&self) -> Address {
        self.operator.clone()
    }

    async fn follow(&self, aa: &Address) -> Result<()> {
        self.client.call_optional::<Value>("follow_aa", json!({ "aa": aa })).await?;
        Ok(())
    }

    async fn get_state_vars(&self, aa: &Address) -> Result<StateVars> {
        self.client.call("get_aa_state_vars", json!({ "aa": aa })).await
    }

    async fn lock_upcoming_state(&self) -> UpcomingStateGuard {
        self.upcoming.clone().lock_owned().await
    }

    async fn get_upcoming_state_vars(&self) -> Result<Value> {
        self.client.call("get_upcoming_state_vars", json!({})).await
    }

    async fn get_upcoming_balances(&self) -> Result<Value> {
        self.client.call("get_upcoming_balances", json!({})).await
    }

    async fn evaluate_getter(
        &self,
        aa: &Address,
        getter: &str,
        args: &[Value],
        snapshot: &StateSnapshot,
    ) -> Result<Value> {
        self.client
            .call(
                "execute_getter",
                json!({
                    "aa": aa,
                    "getter": getter,
                    "args": args,
                    "state_vars": snapshot.state_vars,
                    "balances": snapshot.balances,
                }),
            )
            .await
    }

    async fn submit_request(&self, aa: &Address, payload: &Value) -> Result<Option<String>> {
        self.client
            .call_optional("send_aa_request", json!({ "aa": aa, "data": payload }))
            .await
    }

    async fn read_unit(&self, unit: &str) -> Result<Unit> {
        self.client.call("read_joint", json!({ "unit": unit })).await
    }

    async fn apply_upcoming_request(&self, unit: &Unit, aa: &Address) -> Result<()> {
        self.client
            .call_optional::<Value>("on_aa_request", json!({ "unit": unit, "aa": aa }))
            .await?;
        Ok(())
    }

    async fn read_definition(&self, aa: &Address) -> Result<Value> {
        self.client.call("read_aa_definition", json!({ "aa": aa })).await
    }

    async fn load(&self, aa: &Address) -> Result<Value> {
        self.client.call("load_aa", json!({ "aa": aa })).await
    }

    async fn insert_definition(&self, aa: &Address, definition: &Value) -> Result<()> {
        self.client
            .call_optional::<Value>(
                "insert_aa_definition",
                json!({ "aa": aa, "definition": definition }),
            )
            .await?;
        Ok(())
    }

    async fn watch_address(&self, address: &Address) -> Result<()> {
        self.client
            .call_optional::<Value>("add_watched_address", json!({ "address": address }))
            .await?;
        Ok(())
    }

    async fn request_history(&self, assets: &[String]) -> Result<()> {
        self.client
            .call_optional::<Value>("request_history_for", json!({ "assets": assets }))
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LedgerEvent>> {
        let cursor: u64 = self.client.call("get_event_cursor", json!({})).await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(poll_events(self.client.clone(), cursor, self.poll_interval, tx));
        Ok(rx)
    }
}

/// Pull events from `cursor` onwards until the subscriber goes away.
async fn poll_events(
    client: RpcClient,
    mut cursor: u64,
    interval: Duration,
    tx: mpsc::Sender<LedgerEvent>,
) {
    info!(cursor, "Polling ledger events");
    loop {
        match client
            .call::<PollEventsResult>("poll_events", json!({ "cursor": cursor }))
            .await
        {
            Ok(batch) => {
                if !batch.events.is_empty() {
                    debug!(count = batch.events.len(), cursor = batch.cursor, "Received events");
                }
                for event in batch.events {
                    if tx.send(event).await.is_err() {
                        error!("Event channel closed, stopping poller");
                        return;
                    }
                }
                cursor = batch.cursor;
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), delay = ?POLL_RETRY_DELAY, "Failed to poll events, retrying");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
            }
        }
    }
}
