//! In-memory ledger and clock for tests.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::ledger::{
    AaResponse, Address, Author, Ledger, LedgerEvent, Message, ResponseBody, StateSnapshot,
    StateVars, Unit, UpcomingStateGuard,
};
use crate::policy::GracePeriod;
use crate::request_ids::parse_request_id;

/// Wall-clock second at which every test starts.
pub const T0: u64 = 1_700_000_000;

pub fn test_config() -> AppConfig {
    AppConfig {
        rpc_url: "http://127.0.0.1:0".into(),
        vrf_oracle_aa: "ORACLE".into(),
        consumer_aas: vec!["CONSUMER".into()],
        lib_aas: vec!["LIB".into()],
        attestors: vec!["ATTESTOR".into()],
        proof_key: Arc::new(b"test-proof-key".to_vec()),
        grace_period: GracePeriod {
            timeout: Duration::from_secs(600),
            margin: Duration::from_secs(30),
        },
        reconcile_interval: Duration::from_secs(3 * 3600),
        event_poll_interval: Duration::from_millis(100),
        http_port: 0,
    }
}

/// Let spawned tasks run to quiescence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A consumer response announcing requests through `vars`.
pub fn consumer_response(trigger: &str, vars: Value, timestamp: u64) -> AaResponse {
    AaResponse {
        aa_address: "CONSUMER".into(),
        trigger_unit: format!("trigger-{trigger}-{timestamp}"),
        trigger_address: trigger.into(),
        bounced: false,
        response: ResponseBody {
            error: None,
            response_vars: vars.as_object().cloned(),
        },
        timestamp,
    }
}

/// A unit in which `provider` posts its proof to the oracle.
pub fn provider_unit(provider: &str, consumer: &str, request_id: u64) -> Unit {
    Unit {
        unit: format!("unit-{provider}-{consumer}-{request_id}"),
        authors: vec![Author { address: provider.into() }],
        messages: vec![Message {
            app: "data".into(),
            payload: json!({ "consumer_aa": consumer, "req_id": request_id, "proof": "p" }),
        }],
        timestamp: T0,
    }
}

/// Clock anchored to tokio's (pausable) time.
pub struct PausedClock {
    origin: tokio::time::Instant,
}

impl PausedClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now_ms(&self) -> u64 {
        T0 * 1000 + self.origin.elapsed().as_millis() as u64
    }
}

#[derive(Default)]
struct State {
    definitions: HashMap<Address, Value>,
    state_vars: HashMap<Address, StateVars>,
    units: HashMap<String, Unit>,
    fulfilled: HashSet<(Address, u64)>,
    submissions: Vec<Value>,
    followed: Vec<Address>,
    watched: Vec<Address>,
    inserted: Vec<Address>,
    history: Vec<String>,
    fail_submissions: bool,
    submit_delay: Duration,
    events: Option<mpsc::Sender<LedgerEvent>>,
}

/// Ledger whose getter fails once a proof for the request was applied.
pub struct FakeLedger {
    operator: Address,
    upcoming: Arc<tokio::sync::Mutex<()>>,
    next_unit: AtomicU64,
    state: Mutex<State>,
}

impl FakeLedger {
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.into(),
            upcoming: Arc::new(tokio::sync::Mutex::new(())),
            next_unit: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    pub fn set_definition(&self, aa: &str, definition: Value) {
        self.state.lock().unwrap().definitions.insert(aa.into(), definition);
    }

    pub fn set_state_vars(&self, aa: &str, vars: Value) {
        let vars = vars.as_object().cloned().unwrap_or_default();
        self.state.lock().unwrap().state_vars.insert(aa.into(), vars);
    }

    pub fn insert_unit(&self, unit: Unit) {
        self.state.lock().unwrap().units.insert(unit.unit.clone(), unit);
    }

    pub fn set_fail_submissions(&self, fail: bool) {
        self.state.lock().unwrap().fail_submissions = fail;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = delay;
    }

    /// Payloads of every accepted submission.
    pub fn submissions(&self) -> Vec<Value> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn followed(&self) -> Vec<Address> {
        self.state.lock().unwrap().followed.clone()
    }

    pub fn watched(&self) -> Vec<Address> {
        self.state.lock().unwrap().watched.clone()
    }

    pub fn inserted(&self) -> Vec<Address> {
        self.state.lock().unwrap().inserted.clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.state.lock().unwrap().history.clone()
    }

    pub async fn emit(&self, event: LedgerEvent) {
        let sender = self.state.lock().unwrap().events.clone();
        sender.expect("not subscribed").send(event).await.unwrap();
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    fn operator_address(&self) -> Address {
        self.operator.clone()
    }

    async fn follow(&self, aa: &Address) -> Result<()> {
        self.state.lock().unwrap().followed.push(aa.clone());
        Ok(())
    }

    async fn get_state_vars(&self, aa: &Address) -> Result<StateVars> {
        Ok(self.state.lock().unwrap().state_vars.get(aa).cloned().unwrap_or_default())
    }

    async fn lock_upcoming_state(&self) -> UpcomingStateGuard {
        self.upcoming.clone().lock_owned().await
    }

    async fn get_upcoming_state_vars(&self) -> Result<Value> {
        Ok(json!({}))
    }

    async fn get_upcoming_balances(&self) -> Result<Value> {
        Ok(json!({}))
    }

    async fn evaluate_getter(
        &self,
        aa: &Address,
        getter: &str,
        args: &[Value],
        _snapshot: &StateSnapshot,
    ) -> Result<Value> {
        assert!(self.upcoming.try_lock().is_err(), "getter evaluated without upcoming lock");
        assert_eq!(getter, "get_randomness_request");
        let request_id = args.first().and_then(parse_request_id).ok_or_else(|| anyhow!("bad args"))?;
        if self.state.lock().unwrap().fulfilled.contains(&(aa.clone(), request_id)) {
            bail!("request {request_id} already fulfilled");
        }
        Ok(json!({ "status": "pending" }))
    }

    async fn submit_request(&self, aa: &Address, payload: &Value) -> Result<Option<String>> {
        let (fail, delay) = {
            let state = self.state.lock().unwrap();
            (state.fail_submissions, state.submit_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Ok(None);
        }
        let unit = Unit {
            unit: format!("sent-{}", self.next_unit.fetch_add(1, Ordering::Relaxed)),
            authors: vec![Author { address: self.operator.clone() }],
            messages: vec![Message { app: "data".into(), payload: payload.clone() }],
            timestamp: T0,
        };
        let id = unit.unit.clone();
        let mut state = self.state.lock().unwrap();
        assert_eq!(*aa, Address::from("ORACLE"));
        state.submissions.push(payload.clone());
        state.units.insert(id.clone(), unit);
        Ok(Some(id))
    }

    async fn read_unit(&self, unit: &str) -> Result<Unit> {
        self.state
            .lock()
            .unwrap()
            .units
            .get(unit)
            .cloned()
            .ok_or_else(|| anyhow!("unit {unit} not found"))
    }

    async fn apply_upcoming_request(&self, unit: &Unit, _aa: &Address) -> Result<()> {
        let data = unit.trigger_data().ok_or_else(|| anyhow!("no data"))?;
        let consumer = data.get("consumer_aa").and_then(Value::as_str).map(Address::from);
        let request_id = data.get("req_id").and_then(parse_request_id);
        if let (Some(consumer), Some(request_id)) = (consumer, request_id) {
            self.state.lock().unwrap().fulfilled.insert((consumer, request_id));
        }
        Ok(())
    }

    async fn read_definition(&self, aa: &Address) -> Result<Value> {
        self.state
            .lock()
            .unwrap()
            .definitions
            .get(aa)
            .cloned()
            .ok_or_else(|| anyhow!("no definition for {aa}"))
    }

    async fn load(&self, aa: &Address) -> Result<Value> {
        self.read_definition(aa).await
    }

    async fn insert_definition(&self, aa: &Address, _definition: &Value) -> Result<()> {
        self.state.lock().unwrap().inserted.push(aa.clone());
        Ok(())
    }

    async fn watch_address(&self, address: &Address) -> Result<()> {
        self.state.lock().unwrap().watched.push(address.clone());
        Ok(())
    }

    async fn request_history(&self, assets: &[String]) -> Result<()> {
        self.state.lock().unwrap().history.extend_from_slice(assets);
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LedgerEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().events = Some(tx);
        Ok(rx)
    }
}
