//! Extraction of randomness request ids from consumer contract responses.

use serde_json::Value;
use tracing::{debug, warn};

use crate::ledger::AaResponse;

/// Event tag marking a batch entry that needs randomness.
const REWARD_EVENT: &str = "reward";

/// Parse a request id given as a JSON number or a numeric string.
pub fn parse_request_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Request ids announced by a consumer contract's response.
///
/// A single request sets `plot_num`; a batch is announced in `events`, a JSON
/// list where every `reward` entry carries its own `plot_num`. Anything
/// malformed yields no ids.
pub fn request_ids(response: &AaResponse) -> Vec<u64> {
    let aa = &response.aa_address;
    let Some(vars) = &response.response.response_vars else {
        debug!(%aa, "No response vars");
        return Vec::new();
    };

    if let Some(id) = vars.get("plot_num").and_then(parse_request_id).filter(|id| *id != 0) {
        return vec![id];
    }

    if let Some(events) = vars.get("events") {
        let parsed = match events {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(v) => v,
                Err(e) => {
                    warn!(%aa, error = %e, "Unparseable events in response vars");
                    return Vec::new();
                }
            },
            other => other.clone(),
        };
        let Some(list) = parsed.as_array() else {
            warn!(%aa, "Response events are not a list");
            return Vec::new();
        };
        let ids: Vec<u64> = list
            .iter()
            .filter(|e| e.get("type").and_then(Value::as_str) == Some(REWARD_EVENT))
            .filter_map(|e| e.get("plot_num").and_then(parse_request_id))
            .collect();
        debug!(%aa, ?ids, "Reward plots");
        return ids;
    }

    debug!(%aa, ?vars, "No plot_num or events in response vars");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Address, ResponseBody};
    use serde_json::json;

    fn response(vars: Option<Value>) -> AaResponse {
        AaResponse {
            aa_address: Address::from("CONSUMER"),
            trigger_unit: "u".into(),
            trigger_address: Address::from("USER"),
            bounced: false,
            response: ResponseBody {
                error: None,
                response_vars: vars.map(|v| v.as_object().cloned().unwrap()),
            },
            timestamp: 0,
        }
    }

    #[test]
    fn single_plot_num() {
        assert_eq!(request_ids(&response(Some(json!({ "plot_num": 12 })))), vec![12]);
        assert_eq!(request_ids(&response(Some(json!({ "plot_num": "13" })))), vec![13]);
    }

    #[test]
    fn reward_events_in_encoded_list() {
        let events = json!([{ "type": "reward", "plot_num": 7 }, { "type": "other" }]).to_string();
        assert_eq!(request_ids(&response(Some(json!({ "events": events })))), vec![7]);
    }

    #[test]
    fn reward_events_in_plain_list() {
        let vars = json!({ "events": [
            { "type": "reward", "plot_num": 3 },
            { "type": "reward", "plot_num": 4 },
            { "type": "reward" }
        ]});
        assert_eq!(request_ids(&response(Some(vars))), vec![3, 4]);
    }

    #[test]
    fn malformed_payloads_yield_nothing() {
        assert!(request_ids(&response(None)).is_empty());
        assert!(request_ids(&response(Some(json!({ "events": "not json" })))).is_empty());
        assert!(request_ids(&response(Some(json!({ "events": "{\"a\":1}" })))).is_empty());
        assert!(request_ids(&response(Some(json!({ "message": "ok" })))).is_empty());
    }

    #[test]
    fn zero_plot_num_falls_through_to_events() {
        let events = json!([{ "type": "reward", "plot_num": 9 }]).to_string();
        let vars = json!({ "plot_num": 0, "events": events });
        assert_eq!(request_ids(&response(Some(vars))), vec![9]);
    }
}
