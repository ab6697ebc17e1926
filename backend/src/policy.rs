//! Quorum-or-timeout decision for the finishing provider.
//!
//! The finishing provider waits until every non-finishing provider has posted
//! its proof, but never past `request timestamp + grace period`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriod {
    /// How long the finishing provider waits for its peers.
    pub timeout: Duration,
    /// Extra slack on top of `timeout` to absorb clock skew between providers.
    pub margin: Duration,
}

impl GracePeriod {
    /// Deadline in Unix milliseconds for a request created at `timestamp` (seconds).
    pub fn deadline_ms(&self, timestamp: u64) -> u64 {
        timestamp
            .saturating_mul(1000)
            .saturating_add(self.timeout.as_millis() as u64)
            .saturating_add(self.margin.as_millis() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Quorum reached or deadline passed.
    Submit,
    /// Below quorum, re-check after this long.
    Wait(Duration),
    /// Below quorum and there is no timestamp to derive a deadline from.
    MissingDeadline,
}

pub fn evaluate(posted: usize, required: usize, deadline_ms: Option<u64>, now_ms: u64) -> Decision {
    if posted >= required {
        return Decision::Submit;
    }
    match deadline_ms {
        Some(deadline) if deadline > now_ms => {
            Decision::Wait(Duration::from_millis(deadline - now_ms))
        }
        Some(_) => Decision::Submit,
        None => Decision::MissingDeadline,
    }
}
