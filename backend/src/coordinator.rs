//! Request coordination engine.
//!
//! The [`Coordinator`] reacts to ledger events, tracks which peers have posted
//! proofs for each request, and decides when to submit our own proof:
//!
//! - **Non-finishing provider**: submits as soon as a request is seen.
//! - **Finishing provider**: waits until every non-finishing peer has posted,
//!   or until the request's deadline, whichever comes first.
//!
//! Live events, reconciliation findings and deadline expiries all become a
//! [`Command`] consumed by the [`Driver`], which runs one handler task per
//! command. Handlers always re-read the request from upcoming ledger state, so
//! duplicate deliveries converge on a single submission.

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::ledger::{AaResponse, Address, Ledger, LedgerEvent, StateSnapshot, Unit};
use crate::metrics::Metrics;
use crate::policy::{self, Decision};
use crate::reconcile;
use crate::registry::{Posted, Registry, RequestKey};
use crate::request_ids::{parse_request_id, request_ids};
use crate::role::Role;
use crate::vrf;

/// Consumer getter that fails once a request is no longer pending.
const REQUEST_GETTER: &str = "get_randomness_request";

/// What caused a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The request was seen in a consumer response or by reconciliation.
    Request,
    /// The last missing peer proof arrived.
    Quorum,
    /// A deadline timer of the given generation fired.
    Timer(u64),
}

#[derive(Debug)]
pub struct Command {
    pub key: RequestKey,
    /// Request creation time in seconds; absent for quorum completion.
    pub timestamp: Option<u64>,
    pub origin: Origin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Below quorum; a deadline timer is armed.
    Waiting(Duration),
    /// The timer or quorum signal no longer matches the registry.
    Superseded,
    /// The request is already serviced or being serviced.
    Stale,
    /// The ledger produced no transaction.
    SubmitFailed,
    Submitted(String),
}

pub struct Coordinator {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    config: AppConfig,
    operator: Address,
    role: Role,
    registry: Mutex<Registry>,
    commands: mpsc::UnboundedSender<Command>,
    metrics: Arc<Metrics>,
}

/// Owns the command queue and runs handlers; see [`Driver::run`].
pub struct Driver {
    coordinator: Arc<Coordinator>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Coordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        config: AppConfig,
        role: Role,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, Driver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let operator = ledger.operator_address();
        let coordinator = Arc::new(Self {
            ledger,
            clock,
            config,
            operator,
            role,
            registry: Mutex::new(Registry::new()),
            commands: tx,
            metrics,
        });
        let driver = Driver {
            coordinator: coordinator.clone(),
            commands: rx,
        };
        (coordinator, driver)
    }

    pub fn is_finishing(&self) -> bool {
        self.role.is_finishing()
    }

    /// Number of requests currently tracked.
    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub async fn dispatch(&self, event: LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::RequestApplied { unit, responses } => {
                self.on_request_applied(&unit, &responses).await
            }
            LedgerEvent::ResponseApplied { response } => self.on_response_applied(&response).await,
        }
    }

    /// A trigger unit was executed; `responses[0]` is the primary response.
    pub async fn on_request_applied(&self, unit: &Unit, responses: &[AaResponse]) -> Result<()> {
        let Some(trigger_address) = unit.trigger_address() else {
            warn!(unit = %unit.unit, "Trigger unit has no author");
            return Ok(());
        };
        if *trigger_address == self.operator {
            debug!(unit = %unit.unit, "Skipping our own request");
            return Ok(());
        }
        let Some(primary) = responses.first() else {
            return Ok(());
        };
        if primary.bounced {
            info!(
                unit = %unit.unit,
                trigger = %trigger_address,
                error = ?primary.response.error,
                "Trigger will bounce"
            );
            return Ok(());
        }

        let aa = &primary.aa_address;
        if self.config.is_consumer(aa) {
            self.on_consumer_response(primary);
        } else if self.is_peer_proof(aa, trigger_address) {
            info!(provider = %trigger_address, "Received randomness from non-finishing provider request");
            self.on_provider_posted(unit, trigger_address).await;
        }
        Ok(())
    }

    /// A contract response was recorded.
    pub async fn on_response_applied(&self, response: &AaResponse) -> Result<()> {
        if response.bounced {
            if response.trigger_address == self.operator {
                warn!(unit = %response.trigger_unit, error = ?response.response.error, "Our request bounced");
            } else {
                info!(unit = %response.trigger_unit, error = ?response.response.error, "Request bounced");
            }
            return Ok(());
        }
        if response.trigger_address == self.operator {
            debug!(unit = %response.trigger_unit, "Skipping response to our own request");
            return Ok(());
        }

        let aa = &response.aa_address;
        if self.config.is_consumer(aa) {
            debug!(%aa, unit = %response.trigger_unit, "Response from consumer");
            self.on_consumer_response(response);
        } else if self.is_peer_proof(aa, &response.trigger_address) {
            info!(provider = %response.trigger_address, "Received randomness from non-finishing provider response");
            let unit = self
                .ledger
                .read_unit(&response.trigger_unit)
                .await
                .with_context(|| format!("failed to read trigger {}", response.trigger_unit))?;
            self.on_provider_posted(&unit, &response.trigger_address).await;
        }
        Ok(())
    }

    fn is_peer_proof(&self, aa: &Address, trigger_address: &Address) -> bool {
        *aa == self.config.vrf_oracle_aa && self.role.is_peer(trigger_address)
    }

    fn on_consumer_response(&self, response: &AaResponse) {
        for request_id in request_ids(response) {
            self.metrics.record_request();
            self.enqueue(Command {
                key: RequestKey::new(response.aa_address.clone(), request_id),
                timestamp: Some(response.timestamp),
                origin: Origin::Request,
            });
        }
    }

    async fn on_provider_posted(&self, unit: &Unit, provider: &Address) {
        let data = unit.trigger_data();
        let consumer = data
            .and_then(|d| d.get("consumer_aa"))
            .and_then(Value::as_str)
            .map(Address::from);
        let request_id = data.and_then(|d| d.get("req_id")).and_then(parse_request_id);
        let (Some(consumer), Some(request_id)) = (consumer, request_id) else {
            warn!(unit = %unit.unit, "req_id or consumer_aa not found in provider trigger");
            return;
        };

        let key = RequestKey::new(consumer, request_id);
        let required = self.role.required();
        let posted = {
            let mut registry = self.registry.lock().await;
            let posted = registry.record_posted(&key, provider.clone());
            self.metrics.set_pending(registry.len());
            posted
        };
        let posted = match posted {
            Posted::New(count) => count,
            Posted::Duplicate(count) => {
                debug!(%key, %provider, count, "Duplicate peer proof");
                return;
            }
            Posted::Completed => {
                debug!(%key, %provider, "Peer proof for a request we already served");
                return;
            }
        };
        self.metrics.record_provider_proof();
        info!(%key, posted, required, "Peer proofs received");

        if posted == required {
            self.enqueue(Command {
                key,
                timestamp: None,
                origin: Origin::Quorum,
            });
        }
    }

    /// Queue every request still pending on-chain. Returns how many were found.
    pub async fn reconcile(&self) -> Result<usize> {
        let missed = reconcile::find_pending(self.ledger.as_ref(), &self.config.consumer_aas).await?;
        for request in &missed {
            self.metrics.record_request();
            self.enqueue(Command {
                key: RequestKey::new(request.consumer.clone(), request.request_id),
                timestamp: Some(request.timestamp),
                origin: Origin::Request,
            });
        }
        self.metrics.record_sweep();
        Ok(missed.len())
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Command queue closed, dropping request");
        }
    }

    /// Decide whether to submit now and, if so, submit.
    #[instrument(skip_all, fields(key = %key, origin = ?origin))]
    pub async fn handle_request(
        &self,
        key: &RequestKey,
        timestamp: Option<u64>,
        origin: Origin,
    ) -> Result<Outcome> {
        if self.role.is_finishing() {
            let now = self.clock.now_ms();
            let required = self.role.required();
            let mut registry = self.registry.lock().await;
            match origin {
                Origin::Timer(generation) if registry.timer_generation(key) != Some(generation) => {
                    debug!("Timer superseded");
                    return Ok(Outcome::Superseded);
                }
                Origin::Quorum
                    if registry
                        .get(key)
                        .is_none_or(|p| p.posted_providers.len() < required) =>
                {
                    debug!("Quorum already handled");
                    return Ok(Outcome::Superseded);
                }
                _ => {}
            }
            if registry.is_completed(key) {
                // Only the upcoming-state check can tell whether our proof bounced.
                drop(registry);
                debug!("Already served, rechecking upcoming state");
                return self.submit(key).await;
            }

            let posted = registry.entry(key).posted_providers.len();
            let deadline = timestamp.map(|ts| self.config.grace_period.deadline_ms(ts));
            match policy::evaluate(posted, required, deadline, now) {
                Decision::Wait(remaining) => {
                    self.arm_timer(&mut registry, key, timestamp, remaining);
                    self.metrics.set_pending(registry.len());
                    info!(
                        posted,
                        required,
                        wait_secs = remaining.as_secs(),
                        "Will post randomness at deadline or when all non-finishing providers post"
                    );
                    return Ok(Outcome::Waiting(remaining));
                }
                Decision::MissingDeadline => {
                    bail!("no timestamp for {key} with {posted} of {required} proofs")
                }
                Decision::Submit => {
                    let entry = registry.remove(key).unwrap_or_default();
                    self.metrics.set_pending(registry.len());
                    info!(posted = ?entry.posted_providers, required, "Posting final randomness");
                }
            }
        }

        self.submit(key).await
    }

    fn arm_timer(
        &self,
        registry: &mut Registry,
        key: &RequestKey,
        timestamp: Option<u64>,
        remaining: Duration,
    ) {
        let generation = registry.next_generation();
        let commands = self.commands.clone();
        let command = Command {
            key: key.clone(),
            timestamp,
            origin: Origin::Timer(generation),
        };
        let timer = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = commands.send(command);
        });
        registry.arm_timer(key, generation, timer.abort_handle());
        self.metrics.record_timer();
    }

    async fn submit(&self, key: &RequestKey) -> Result<Outcome> {
        {
            let _upcoming = self.ledger.lock_upcoming_state().await;
            if !self.registry.lock().await.begin_submission(key) {
                debug!("Already being submitted");
                self.metrics.record_stale();
                return Ok(Outcome::Stale);
            }
            let checked = self.check_request(key).await;
            if !matches!(checked, Ok(true)) {
                self.registry.lock().await.finish_submission(key);
            }
            if !checked? {
                self.metrics.record_stale();
                return Ok(Outcome::Stale);
            }
        }

        let result = self.send_proof(key).await;
        let mut registry = self.registry.lock().await;
        registry.finish_submission(key);
        if matches!(result, Ok(Outcome::Submitted(_))) {
            registry.complete(key);
            self.metrics.set_pending(registry.len());
        }
        result
    }

    /// Whether the consumer still reports the request as open in upcoming state.
    async fn check_request(&self, key: &RequestKey) -> Result<bool> {
        let snapshot = StateSnapshot {
            state_vars: self.ledger.get_upcoming_state_vars().await?,
            balances: self.ledger.get_upcoming_balances().await?,
        };
        let args = [Value::from(key.request_id)];
        match self
            .ledger
            .evaluate_getter(&key.consumer, REQUEST_GETTER, &args, &snapshot)
            .await
        {
            Ok(request) => {
                debug!(?request, "{REQUEST_GETTER}");
                Ok(true)
            }
            Err(e) => {
                info!(error = %format!("{e:#}"), "{REQUEST_GETTER} failed");
                Ok(false)
            }
        }
    }

    async fn send_proof(&self, key: &RequestKey) -> Result<Outcome> {
        let seed = vrf::request_seed(&key.consumer, key.request_id);
        let proof = vrf::generate_proof(&seed, &self.config.proof_key);
        let payload = json!({
            "consumer_aa": key.consumer,
            "req_id": key.request_id,
            "proof": proof,
        });

        let oracle = &self.config.vrf_oracle_aa;
        let unit = match self.ledger.submit_request(oracle, &payload).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                self.metrics.record_failure();
                warn!("Sending randomness failed");
                return Ok(Outcome::SubmitFailed);
            }
            Err(e) => {
                self.metrics.record_failure();
                warn!(error = %format!("{e:#}"), "Sending randomness failed");
                return Ok(Outcome::SubmitFailed);
            }
        };
        self.metrics.record_submission();
        info!(%unit, "Sent randomness");

        let joint = self
            .ledger
            .read_unit(&unit)
            .await
            .with_context(|| format!("failed to read back {unit}"))?;
        self.ledger
            .apply_upcoming_request(&joint, oracle)
            .await
            .with_context(|| format!("failed to apply {unit} to upcoming state"))?;
        Ok(Outcome::Submitted(unit))
    }
}

impl Driver {
    /// Process events and commands until a fatal error.
    ///
    /// Also re-runs reconciliation every `reconcile_interval`. Returns when the
    /// event feed closes or a handler fails.
    pub async fn run(self, mut events: mpsc::Receiver<LedgerEvent>) -> Result<()> {
        let Driver {
            coordinator,
            mut commands,
        } = self;
        let period = coordinator.config.reconcile_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => coordinator.dispatch(event).await?,
                    None => bail!("ledger event feed closed"),
                },
                Some(command) = commands.recv() => {
                    let coordinator = coordinator.clone();
                    tasks.spawn(async move {
                        coordinator
                            .handle_request(&command.key, command.timestamp, command.origin)
                            .await
                    });
                }
                Some(joined) = tasks.join_next() => {
                    let outcome = joined.context("request handler panicked")??;
                    debug!(?outcome, "Request handled");
                }
                _ = sweep.tick() => {
                    let found = coordinator.reconcile().await?;
                    info!(found, "Reconciliation sweep done");
                }
            }
        }
    }
}
