//! Position store — the single writer-of-record for position state.
//!
//! All mutation flows through [`PositionStore::transition`], which
//! requires the caller to hold that position's [`OperationGuard`].
//! Holding the guard is what the monitors race for: whichever acquires
//! it first proceeds, the other defers to its next cycle. The guard is
//! RAII — dropping it releases the position.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::position::{ExitReason, Position, PositionError, PositionStatus, ReviewReason};

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("position not found: {0}")]
    NotFound(Uuid),

    #[error("position {id} already stored")]
    Duplicate { id: Uuid },

    /// The transition is not an edge of the lifecycle graph, or the
    /// position is already terminal.
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error(transparent)]
    Invalid(#[from] PositionError),
}

/// Optional fields applied alongside a status transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionFields {
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl TransitionFields {
    /// Terminal-exit fields stamped with the current time.
    #[must_use]
    pub fn exited(reason: ExitReason) -> Self {
        Self {
            exit_time: Some(Utc::now()),
            exit_reason: Some(reason),
        }
    }
}

/// Exclusive-operation guard for a single position.
///
/// At most one guard exists per position at any instant; it is the
/// precondition for calling [`PositionStore::transition`].
pub struct OperationGuard {
    id: Uuid,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl OperationGuard {
    /// The position this guard locks.
    #[must_use]
    pub fn position_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

/// Authoritative in-memory repository of position entities.
pub struct PositionStore {
    positions: RwLock<HashMap<Uuid, Position>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl PositionStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Stores a new position after re-validating its shape.
    pub fn create(&self, position: Position) -> Result<Uuid, StoreError> {
        position.validate()?;
        let id = position.id;
        let mut positions = self.positions.write();
        if positions.contains_key(&id) {
            return Err(StoreError::Duplicate { id });
        }
        debug!(
            position_id = %id,
            symbol = position.symbol,
            strategy = %position.strategy,
            contracts = position.contracts,
            "Position stored"
        );
        positions.insert(id, position);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Position> {
        self.positions.read().get(&id).cloned()
    }

    /// All non-terminal positions, oldest entry first.
    #[must_use]
    pub fn list_open(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.entry_time);
        open
    }

    /// Positions the monitors may act on: `Open`, no review hold.
    #[must_use]
    pub fn list_actionable(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self
            .positions
            .read()
            .values()
            .filter(|p| p.status == PositionStatus::Open && p.review.is_none())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.entry_time);
        open
    }

    /// Attempts to acquire the exclusive-operation guard for a position.
    ///
    /// Returns `None` when another operation is already in flight; the
    /// caller defers to its next cycle.
    #[must_use]
    pub fn try_begin_operation(&self, id: Uuid) -> Option<OperationGuard> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(id) {
            return None;
        }
        Some(OperationGuard {
            id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Applies a status transition under an operation guard.
    ///
    /// Fails when the position is terminal or the edge is not part of
    /// the lifecycle graph. Returns the updated position.
    pub fn transition(
        &self,
        guard: &OperationGuard,
        new_status: PositionStatus,
        fields: TransitionFields,
    ) -> Result<Position, StoreError> {
        let id = guard.position_id();
        let mut positions = self.positions.write();
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !Self::transition_allowed(position.status, new_status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: position.status,
                to: new_status,
            });
        }

        debug!(
            position_id = %id,
            from = %position.status,
            to = %new_status,
            "Position transition"
        );
        position.status = new_status;
        if let Some(exit_time) = fields.exit_time {
            position.exit_time = Some(exit_time);
        }
        if let Some(exit_reason) = fields.exit_reason {
            position.exit_reason = Some(exit_reason);
        }
        Ok(position.clone())
    }

    /// Refreshes a position's cached risk inputs from live greeks.
    ///
    /// Returns the updated position so the caller can mirror the change
    /// into the risk aggregate.
    pub fn update_risk_inputs(
        &self,
        id: Uuid,
        delta_per_contract: Decimal,
        beta: Decimal,
    ) -> Result<Position, StoreError> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        position.delta_per_contract = delta_per_contract;
        position.beta = beta;
        Ok(position.clone())
    }

    /// Puts a position on manual-review hold.
    pub fn flag_for_review(&self, id: Uuid, reason: ReviewReason) -> Result<(), StoreError> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        warn!(
            position_id = %id,
            symbol = position.symbol,
            reason = %reason,
            "Position held for manual review"
        );
        position.review = Some(reason);
        Ok(())
    }

    /// Clears a manual-review hold (operator action).
    pub fn clear_review(&self, id: Uuid) -> Result<(), StoreError> {
        let mut positions = self.positions.write();
        let position = positions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        position.review = None;
        Ok(())
    }

    fn transition_allowed(from: PositionStatus, to: PositionStatus) -> bool {
        use PositionStatus::{Closed, Closing, ClosedExternally, Expired, Open, Rolled, Rolling};
        matches!(
            (from, to),
            (Open, Closing | Rolling | ClosedExternally | Expired)
                | (Closing, Closed | Open)
                | (Rolling, Rolled | Open)
        )
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ExitRules, Leg, LegSide, StrategyType};
    use condor_gateway::types::{ContractRef, OptionRight};
    use rust_decimal_macros::dec;

    fn create_test_position() -> Position {
        let expiration = Utc::now().date_naive() + chrono::Duration::days(35);
        Position::open(
            "SPY",
            StrategyType::VerticalCredit,
            vec![
                Leg {
                    contract: ContractRef(11),
                    right: OptionRight::Put,
                    strike: dec!(550),
                    expiration,
                    side: LegSide::Sell,
                    ratio: 1,
                },
                Leg {
                    contract: ContractRef(12),
                    right: OptionRight::Put,
                    strike: dec!(545),
                    expiration,
                    side: LegSide::Buy,
                    ratio: 1,
                },
            ],
            2,
            dec!(1.50),
            ExitRules {
                take_profit_price: dec!(0.75),
                stop_loss_price: dec!(3.75),
                max_profit: dec!(300),
                max_loss: dec!(700),
            },
            dec!(0.12),
            dec!(1.0),
        )
        .unwrap()
    }

    #[test]
    fn create_and_get_roundtrip() {
        let store = PositionStore::new();
        let position = create_test_position();
        let id = store.create(position).unwrap();
        assert_eq!(store.get(id).unwrap().symbol, "SPY");
        assert_eq!(store.list_open().len(), 1);
    }

    #[test]
    fn duplicate_create_rejected() {
        let store = PositionStore::new();
        let position = create_test_position();
        store.create(position.clone()).unwrap();
        assert!(matches!(
            store.create(position),
            Err(StoreError::Duplicate { .. })
        ));
    }

    #[test]
    fn guard_is_exclusive_until_dropped() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();

        let guard = store.try_begin_operation(id).unwrap();
        assert!(store.try_begin_operation(id).is_none());

        drop(guard);
        assert!(store.try_begin_operation(id).is_some());
    }

    #[test]
    fn close_flow_transitions() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();
        let guard = store.try_begin_operation(id).unwrap();

        store
            .transition(&guard, PositionStatus::Closing, TransitionFields::default())
            .unwrap();
        let closed = store
            .transition(
                &guard,
                PositionStatus::Closed,
                TransitionFields::exited(ExitReason::StopLoss),
            )
            .unwrap();

        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert!(closed.exit_time.is_some());
        assert!(store.list_open().is_empty());
    }

    #[test]
    fn closing_can_revert_to_open() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();
        let guard = store.try_begin_operation(id).unwrap();

        store
            .transition(&guard, PositionStatus::Closing, TransitionFields::default())
            .unwrap();
        let reverted = store
            .transition(&guard, PositionStatus::Open, TransitionFields::default())
            .unwrap();
        assert_eq!(reverted.status, PositionStatus::Open);
    }

    #[test]
    fn terminal_positions_are_immutable() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();
        let guard = store.try_begin_operation(id).unwrap();

        store
            .transition(&guard, PositionStatus::Closing, TransitionFields::default())
            .unwrap();
        store
            .transition(
                &guard,
                PositionStatus::Closed,
                TransitionFields::exited(ExitReason::ProfitTarget),
            )
            .unwrap();

        let err = store
            .transition(&guard, PositionStatus::Open, TransitionFields::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn skipping_the_graph_is_rejected() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();
        let guard = store.try_begin_operation(id).unwrap();

        // Open -> Rolled without passing through Rolling.
        let err = store
            .transition(&guard, PositionStatus::Rolled, TransitionFields::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn review_hold_excludes_from_actionable() {
        let store = PositionStore::new();
        let id = store.create(create_test_position()).unwrap();
        assert_eq!(store.list_actionable().len(), 1);

        store
            .flag_for_review(id, ReviewReason::ReconciliationMismatch)
            .unwrap();
        assert!(store.list_actionable().is_empty());
        // Still open — exposure is real, just frozen.
        assert_eq!(store.list_open().len(), 1);

        store.clear_review(id).unwrap();
        assert_eq!(store.list_actionable().len(), 1);
    }
}
