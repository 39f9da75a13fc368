//! Error types for the brokerage and market-data boundary.
//!
//! The taxonomy distinguishes transient faults (retried locally by the
//! calling monitor) from data-integrity violations (never retried, never
//! silently resolved — the affected position is frozen for manual
//! attention while the rest of the engine keeps running).

use thiserror::Error;

use crate::types::OrderHandle;

/// Errors that can occur when interacting with the order gateway or the
/// market-data provider.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A leg's contract specification could not be resolved to a tradable
    /// contract. Any multi-leg operation aborts before submission.
    #[error("contract resolution failed: {spec}")]
    ContractResolution {
        /// Display form of the unresolvable spec.
        spec: String,
    },

    /// No fill confirmation arrived within the bounded wait.
    #[error("order {handle} not filled within {waited_secs}s")]
    OrderTimeout {
        /// Handle of the order that timed out.
        handle: OrderHandle,
        /// Seconds waited before giving up.
        waited_secs: u64,
    },

    /// The gateway reported a fill whose leg set or quantities differ
    /// from what was submitted. The atomic multi-leg invariant has been
    /// violated by the environment; this is never recoverable
    /// automatically.
    #[error(
        "partial fill mismatch on {handle}: submitted {submitted_legs} legs, gateway reported {reported_legs}"
    )]
    PartialFillMismatch {
        /// Handle of the mismatched order.
        handle: OrderHandle,
        /// Number of legs submitted.
        submitted_legs: usize,
        /// Number of legs the gateway reported filled as expected.
        reported_legs: usize,
    },

    /// Order rejected outright by the gateway.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Order handle unknown to the gateway.
    #[error("order not found: {handle}")]
    OrderNotFound {
        /// The unknown handle.
        handle: OrderHandle,
    },

    /// Transient connectivity failure to the brokerage.
    #[error("gateway connectivity error: {0}")]
    Connectivity(String),

    /// Market data unavailable for a symbol or contract.
    #[error("market data unavailable: {0}")]
    MarketData(String),
}

impl GatewayError {
    /// Creates a contract resolution error from any displayable spec.
    pub fn contract_resolution(spec: impl Into<String>) -> Self {
        Self::ContractResolution { spec: spec.into() }
    }

    /// Creates an order timeout error.
    pub fn order_timeout(handle: OrderHandle, waited_secs: u64) -> Self {
        Self::OrderTimeout {
            handle,
            waited_secs,
        }
    }

    /// Creates a partial fill mismatch error.
    pub fn partial_fill_mismatch(
        handle: OrderHandle,
        submitted_legs: usize,
        reported_legs: usize,
    ) -> Self {
        Self::PartialFillMismatch {
            handle,
            submitted_legs,
            reported_legs,
        }
    }

    /// Returns true if the failure is transient and the operation may be
    /// retried on a later cycle without risking state corruption.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::MarketData(_) | Self::OrderTimeout { .. }
        )
    }

    /// Returns true if the failure indicates the engine's view of real
    /// exposure can no longer be trusted for the affected position.
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::PartialFillMismatch { .. })
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_is_transient() {
        let err = GatewayError::Connectivity("socket closed".to_string());
        assert!(err.is_transient());
        assert!(!err.is_integrity_violation());
    }

    #[test]
    fn timeout_is_transient() {
        let err = GatewayError::order_timeout(OrderHandle("ORD-1".to_string()), 30);
        assert!(err.is_transient());
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn partial_fill_mismatch_is_integrity_violation() {
        let err =
            GatewayError::partial_fill_mismatch(OrderHandle("ORD-2".to_string()), 4, 3);
        assert!(!err.is_transient());
        assert!(err.is_integrity_violation());
        assert!(err.to_string().contains("4 legs"));
    }

    #[test]
    fn resolution_failure_is_not_transient() {
        let err = GatewayError::contract_resolution("SPY 600C 2026-01-16");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("SPY 600C"));
    }
}
