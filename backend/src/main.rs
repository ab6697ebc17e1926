//! VRF Oracle Coordinator
//!
//! Off-chain service run by each provider of a multi-provider randomness
//! oracle. It watches consumer contracts for randomness requests and posts
//! proofs to the shared oracle contract. One provider is the *finishing
//! provider*: it waits for the other providers' proofs (or a deadline) before
//! posting the final one. Runs two concurrent subsystems:
//!
//! - **Coordinator**: ledger event feed, quorum/timeout policy, periodic
//!   reconciliation of missed requests.
//! - **HTTP server**: Liveness (`/health`) and readiness (`/status`) probes.

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

mod clock;
mod config;
mod coordinator;
mod ledger;
mod metrics;
mod policy;
mod reconcile;
mod registry;
mod request_ids;
mod role;
mod rpc;
mod vrf;
mod watch;

#[cfg(test)]
mod testing;

use clock::SystemClock;
use config::AppConfig;
use coordinator::Coordinator;
use metrics::Metrics;
use rpc::RpcLedger;

/// Shared application state accessible from HTTP handlers.
struct AppState {
    metrics: Arc<Metrics>,
    coordinator: Arc<Coordinator>,
}

/// Liveness probe: returns 200 if the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness / status probe: reports coordinator counters.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "finishing_provider": data.coordinator.is_finishing(),
        "metrics": data.metrics.to_json(),
    }))
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    info!(
        oracle = %config.vrf_oracle_aa,
        consumers = config.consumer_aas.len(),
        "Starting VRF oracle coordinator"
    );
    info!(rpc = %config.rpc_url, "Endpoint configured");

    let ledger = Arc::new(RpcLedger::connect(&config.rpc_url, config.event_poll_interval).await?);
    let metrics = Arc::new(Metrics::new());
    let http_port = config.http_port;

    let (coordinator, watcher) =
        watch::start_watching(config, ledger, Arc::new(SystemClock), metrics.clone()).await?;

    let state = web::Data::new(AppState {
        metrics,
        coordinator,
    });

    info!(port = http_port, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/status", web::get().to(status))
    })
    .bind(("0.0.0.0", http_port))?
    .run();

    // The coordinator never stops on its own; if it does, exit so a supervisor restarts us.
    tokio::select! {
        res = server => res.context("HTTP server failed"),
        res = watcher => {
            let res = res.context("coordinator panicked").and_then(|r| r);
            if let Err(e) = &res {
                error!(error = %format!("{e:#}"), "Coordinator stopped");
            }
            res.context("coordinator stopped")
        }
    }
}
