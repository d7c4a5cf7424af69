//! # Error Handling for the Hedging Engine
//!
//! This module defines the centralized error handling for the crate. It
//! provides a unified `Result` type and a [`HedgeError`] enum covering every
//! failure the engine can surface: rejected configurations, propagated user
//! errors, elapsed deadlines, and exhausted attempt sets.
//!
//! ## The `HedgeError` Enum
//!
//! [`HedgeError`] is the single error type used throughout the crate. User
//! request failures are carried verbatim in the `cause` field: hedging never
//! substitutes one attempt's error for another's: if the winning attempt
//! errors, the caller sees that error.
//!
//! ## The `Result` Type Alias
//!
//! `Result<T>` is shorthand for `std::result::Result<T, HedgeError>`.
//!
//! ### Example
//!
//! ```rust
//! use tail_hedge::error::{HedgeError, Result};
//!
//! fn check_hedges(max_hedges: usize) -> Result<()> {
//!     if max_hedges == 0 {
//!         Err(HedgeError::InvalidConfig {
//!             message: "max_hedges must be at least 1".to_string(),
//!         })
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! assert!(check_hedges(2).is_ok());
//! let error = check_hedges(0).unwrap_err();
//! assert_eq!(
//!     error.to_string(),
//!     "invalid hedge configuration: max_hedges must be at least 1"
//! );
//! ```

use thiserror::Error;
use tower::BoxError;

/// A specialized `Result` type for hedging operations.
pub type Result<T> = std::result::Result<T, HedgeError>;

/// The main error enum for the hedging engine.
///
/// Every variant that wraps a user error keeps the original cause reachable
/// via `source()`, and every terminal variant records how many attempts were
/// observed and how long the call ran.
#[derive(Debug, Error)]
pub enum HedgeError {
    /// The configuration violates a strategy dispatch rule. Raised
    /// synchronously at entry, before any attempt is spawned.
    #[error("invalid hedge configuration: {message}")]
    InvalidConfig { message: String },

    /// The only attempt (or the winner under the fail-fast policy) returned
    /// a user error. The cause is propagated verbatim.
    #[error("request failed after {attempt_count} attempt(s) in {elapsed_ms}ms: {cause}")]
    RequestFailed {
        #[source]
        cause: BoxError,
        attempt_count: usize,
        elapsed_ms: u64,
    },

    /// The overall deadline elapsed before any attempt produced a value.
    #[error("request timed out after {elapsed_ms}ms ({attempt_count} attempt(s) cancelled)")]
    Timeout {
        attempt_count: usize,
        elapsed_ms: u64,
    },

    /// Every spawned attempt returned an error or was cancelled before any
    /// produced a value. The cause is the error of the attempt with the
    /// smallest `(finished_at, completion_rank)`, matching the race rule.
    #[error("all {attempt_count} attempt(s) failed in {elapsed_ms}ms: {cause}")]
    AllAttemptsFailed {
        #[source]
        cause: BoxError,
        attempt_count: usize,
        elapsed_ms: u64,
    },

    /// Multi-tier analog of `AllAttemptsFailed`: no tier produced an
    /// acceptable value.
    #[error("all {tier_count} tier(s) failed in {elapsed_ms}ms")]
    AllTiersFailed { tier_count: usize, elapsed_ms: u64 },

    /// An unexpected failure inside the executor itself. Attempt crashes
    /// are contained and reported per-attempt; this covers engine-side
    /// bookkeeping going wrong.
    #[error("internal hedging error: {message}")]
    Internal { message: String },
}

impl HedgeError {
    /// True for the variants that mean "no value was produced at all", as
    /// opposed to a propagated user error.
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            HedgeError::Timeout { .. }
                | HedgeError::AllAttemptsFailed { .. }
                | HedgeError::AllTiersFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HedgeError::InvalidConfig {
            message: "percentile must be within [50, 99]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid hedge configuration: percentile must be within [50, 99]"
        );

        let err = HedgeError::Timeout {
            attempt_count: 2,
            elapsed_ms: 30_000,
        };
        assert_eq!(
            err.to_string(),
            "request timed out after 30000ms (2 attempt(s) cancelled)"
        );
    }

    #[test]
    fn test_request_failed_preserves_cause() {
        let cause: BoxError = "connection reset".into();
        let err = HedgeError::RequestFailed {
            cause,
            attempt_count: 1,
            elapsed_ms: 12,
        };
        assert!(err.to_string().contains("connection reset"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_exhaustion_classification() {
        assert!(HedgeError::Timeout {
            attempt_count: 1,
            elapsed_ms: 1
        }
        .is_exhaustion());
        assert!(HedgeError::AllTiersFailed {
            tier_count: 3,
            elapsed_ms: 1
        }
        .is_exhaustion());
        assert!(!HedgeError::InvalidConfig {
            message: "x".into()
        }
        .is_exhaustion());
    }

    #[test]
    fn test_result_type() {
        fn example() -> Result<u64> {
            Ok(42)
        }
        assert_eq!(example().unwrap(), 42);
    }
}
