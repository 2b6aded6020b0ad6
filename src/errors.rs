// =============================================================================
// Error taxonomy for the Quasar engine
// =============================================================================
//
// Each variant carries its propagation policy:
//   Transient   — recovered locally (retry with backoff, circuit breaker)
//   Stale       — surfaced as reduced confidence, never aborts a cycle
//   Validation  — surfaced at the boundary; offending entity is skipped
//   Broker      — surfaced to the caller after exhausted retries
//   Persistence — bounded retry, then fatal (exit code 2)
//   Invariant   — fatal; the process aborts
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network timeout, rate limit, or a single malformed upstream message.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// A producer has not refreshed its data within its staleness window.
    #[error("stale data from {data_source}: last update {age_secs}s ago")]
    Stale { data_source: String, age_secs: u64 },

    /// Bad strategy parameters or malformed configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Broker execution failed after all retries were exhausted.
    #[error("broker error after {attempts} attempt(s): {reason}")]
    Broker { attempts: u32, reason: String },

    /// The persistence store rejected a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A state-machine invariant was broken, e.g. reopening a CLOSED position.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether this error is recoverable without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Stale { .. } | Self::Validation(_) | Self::Broker { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_split() {
        assert!(EngineError::Transient("timeout".into()).is_recoverable());
        assert!(EngineError::Validation("bad param".into()).is_recoverable());
        assert!(!EngineError::Persistence("disk full".into()).is_recoverable());
        assert!(!EngineError::Invariant("closed -> open".into()).is_recoverable());
    }

    #[test]
    fn display_includes_context() {
        let err = EngineError::Broker {
            attempts: 3,
            reason: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("connection refused"));
    }
}
