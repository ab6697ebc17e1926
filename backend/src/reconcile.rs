//! Reconciliation sweep: finds requests that are pending on-chain but were
//! never seen live (restarts, dropped notifications).

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::ledger::{Address, Ledger, StateVars};
use crate::request_ids::parse_request_id;

const REQUEST_VAR_PREFIX: &str = "plot_";
const PENDING_STATUS: &str = "pending";

/// A request found pending in a consumer's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedRequest {
    pub consumer: Address,
    pub request_id: u64,
    /// Creation timestamp stored with the request, in seconds.
    pub timestamp: u64,
}

/// Scan every consumer's state for pending requests.
pub async fn find_pending(ledger: &dyn Ledger, consumers: &[Address]) -> Result<Vec<MissedRequest>> {
    info!("Checking for missed requests");
    let mut found = Vec::new();
    for consumer in consumers {
        let vars = ledger.get_state_vars(consumer).await?;
        found.extend(pending_in(consumer, &vars));
    }
    Ok(found)
}

fn pending_in(consumer: &Address, vars: &StateVars) -> Vec<MissedRequest> {
    let mut found = Vec::new();
    for (name, value) in vars {
        let Some(request_id) = request_var_id(name) else {
            continue;
        };
        if value.get("status").and_then(Value::as_str) != Some(PENDING_STATUS) {
            continue;
        }
        let Some(timestamp) = value.get("ts").and_then(Value::as_u64) else {
            warn!(%consumer, var = %name, "Pending request has no timestamp, skipping");
            continue;
        };
        info!(%consumer, var = %name, "Missed request, will send randomness");
        found.push(MissedRequest {
            consumer: consumer.clone(),
            request_id,
            timestamp,
        });
    }
    found
}

/// `plot_<digits>` → request id.
fn request_var_id(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(REQUEST_VAR_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    parse_request_id(&Value::String(digits.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLedger;
    use serde_json::json;

    #[test]
    fn request_var_names() {
        assert_eq!(request_var_id("plot_12"), Some(12));
        assert_eq!(request_var_id("plot_"), None);
        assert_eq!(request_var_id("plot_1a"), None);
        assert_eq!(request_var_id("plot_-1"), None);
        assert_eq!(request_var_id("plots_1"), None);
        assert_eq!(request_var_id("constants"), None);
    }

    #[tokio::test]
    async fn finds_only_pending_requests_with_timestamps() {
        let ledger = FakeLedger::new("OP");
        ledger.set_state_vars(
            "C1",
            json!({
                "constants": { "asset": "ASSET" },
                "plot_1": { "status": "pending", "ts": 1000 },
                "plot_2": { "status": "done", "ts": 1000 },
                "plot_3": { "status": "pending" },
                "plot_x": { "status": "pending", "ts": 1000 }
            }),
        );
        ledger.set_state_vars("C2", json!({ "plot_9": { "status": "pending", "ts": 2000 } }));

        let found = find_pending(&ledger, &["C1".into(), "C2".into()]).await.unwrap();

        assert_eq!(
            found,
            vec![
                MissedRequest { consumer: "C1".into(), request_id: 1, timestamp: 1000 },
                MissedRequest { consumer: "C2".into(), request_id: 9, timestamp: 2000 },
            ]
        );
    }
}
