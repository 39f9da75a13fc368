//! Position data model — strategies, legs, lifecycle status.
//!
//! Leg-shape invariants are validated at construction time, so nothing
//! downstream needs to re-check that an iron condor really has four legs
//! forming two verticals.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use condor_gateway::types::{ContractRef, OptionRight};

pub use condor_gateway::types::OrderSide as LegSide;

/// Multi-leg strategy shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    VerticalCredit,
    VerticalDebit,
    IronCondor,
    IronButterfly,
    Calendar,
}

impl StrategyType {
    /// Exact number of legs this strategy is built from.
    #[must_use]
    pub fn expected_leg_count(self) -> usize {
        match self {
            Self::VerticalCredit | Self::VerticalDebit | Self::Calendar => 2,
            Self::IronCondor | Self::IronButterfly => 4,
        }
    }

    /// True when the position is opened for a net credit.
    #[must_use]
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            Self::VerticalCredit | Self::IronCondor | Self::IronButterfly
        )
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::VerticalCredit => "vertical_credit",
            Self::VerticalDebit => "vertical_debit",
            Self::IronCondor => "iron_condor",
            Self::IronButterfly => "iron_butterfly",
            Self::Calendar => "calendar",
        };
        write!(f, "{name}")
    }
}

/// One option contract within a multi-leg position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub contract: ContractRef,
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub side: LegSide,
    pub ratio: u32,
}

/// A leg before broker resolution — what entry and roll planning work
/// with until the gateway mints contract references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegSpec {
    pub right: OptionRight,
    pub strike: Decimal,
    pub expiration: NaiveDate,
    pub side: LegSide,
    pub ratio: u32,
}

impl LegSpec {
    /// Binds the spec to a resolved contract.
    #[must_use]
    pub fn into_leg(self, contract: ContractRef) -> Leg {
        Leg {
            contract,
            right: self.right,
            strike: self.strike,
            expiration: self.expiration,
            side: self.side,
            ratio: self.ratio,
        }
    }
}

/// Price levels that drive the exit monitor.
///
/// Prices are expressed as the spread's closing cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRules {
    pub take_profit_price: Decimal,
    pub stop_loss_price: Decimal,
    pub max_profit: Decimal,
    pub max_loss: Decimal,
}

/// Lifecycle state machine value.
///
/// `Closing` and `Rolling` are transient and may revert to `Open` on
/// timeout/no-fill; the four terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closing,
    Rolling,
    Closed,
    Rolled,
    ClosedExternally,
    Expired,
}

impl PositionStatus {
    /// Terminal states accept no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rolled | Self::ClosedExternally | Self::Expired
        )
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::Rolling => "ROLLING",
            Self::Closed => "CLOSED",
            Self::Rolled => "ROLLED",
            Self::ClosedExternally => "CLOSED_EXTERNALLY",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{name}")
    }
}

/// Why a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TimeExit,
    ProfitTarget,
    AdvisoryExit,
    Rolled,
    ExternalClose,
    Expired,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StopLoss => "stop_loss",
            Self::TimeExit => "time_exit",
            Self::ProfitTarget => "profit_target",
            Self::AdvisoryExit => "advisory_exit",
            Self::Rolled => "rolled",
            Self::ExternalClose => "external_close",
            Self::Expired => "expired",
            Self::Manual => "manual",
        };
        write!(f, "{name}")
    }
}

/// Why a position is held for manual review.
///
/// A position with a review hold keeps its real exposure but is excluded
/// from all automatic mutation until an operator clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewReason {
    /// Reconciliation found a strict subset of its legs at the broker.
    ReconciliationMismatch,
    /// The gateway reported a fill that differs from the submitted legs.
    PartialFillMismatch,
}

impl std::fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReconciliationMismatch => "reconciliation_mismatch",
            Self::PartialFillMismatch => "partial_fill_mismatch",
        };
        write!(f, "{name}")
    }
}

/// Errors raised at position construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("position has no legs")]
    EmptyLegs,

    #[error("{strategy} expects {expected} legs, got {actual}")]
    LegCountMismatch {
        strategy: StrategyType,
        expected: usize,
        actual: usize,
    },

    #[error("contracts must be >= 1")]
    ZeroContracts,

    #[error("leg ratio must be >= 1")]
    ZeroRatio,

    #[error("{strategy} structure invalid: {detail}")]
    StructureMismatch {
        strategy: StrategyType,
        detail: String,
    },
}

/// An options position tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub strategy: StrategyType,
    pub legs: Vec<Leg>,
    /// Quantity multiplier applied uniformly to all legs.
    pub contracts: u32,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    /// Net premium per combo unit: credit positive, debit negative.
    pub entry_price: Decimal,
    pub exit_rules: ExitRules,
    /// Cached per-contract delta, refreshed by the monitors from live greeks.
    pub delta_per_contract: Decimal,
    /// Cached underlying beta versus the reference index.
    pub beta: Decimal,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Set on a position created by rolling another; points at the old one.
    pub rolled_from: Option<Uuid>,
    /// Manual-review hold; excludes the position from automatic mutation.
    pub review: Option<ReviewReason>,
}

impl Position {
    /// Builds a new open position, validating leg shape against the
    /// strategy.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        symbol: &str,
        strategy: StrategyType,
        legs: Vec<Leg>,
        contracts: u32,
        entry_price: Decimal,
        exit_rules: ExitRules,
        delta_per_contract: Decimal,
        beta: Decimal,
    ) -> Result<Self, PositionError> {
        let position = Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_uppercase(),
            strategy,
            legs,
            contracts,
            status: PositionStatus::Open,
            entry_time: Utc::now(),
            entry_price,
            exit_rules,
            delta_per_contract,
            beta,
            exit_time: None,
            exit_reason: None,
            rolled_from: None,
            review: None,
        };
        position.validate()?;
        Ok(position)
    }

    /// Marks this position as the product of rolling `old_id`.
    #[must_use]
    pub fn with_rolled_from(mut self, old_id: Uuid) -> Self {
        self.rolled_from = Some(old_id);
        self
    }

    /// Re-checks all structural invariants.
    pub fn validate(&self) -> Result<(), PositionError> {
        if self.legs.is_empty() {
            return Err(PositionError::EmptyLegs);
        }
        if self.contracts == 0 {
            return Err(PositionError::ZeroContracts);
        }
        if self.legs.iter().any(|leg| leg.ratio == 0) {
            return Err(PositionError::ZeroRatio);
        }

        let expected = self.strategy.expected_leg_count();
        if self.legs.len() != expected {
            return Err(PositionError::LegCountMismatch {
                strategy: self.strategy,
                expected,
                actual: self.legs.len(),
            });
        }

        match self.strategy {
            StrategyType::VerticalCredit | StrategyType::VerticalDebit => {
                self.validate_vertical(&self.legs)
            }
            StrategyType::IronCondor => self.validate_two_verticals(false),
            StrategyType::IronButterfly => self.validate_two_verticals(true),
            StrategyType::Calendar => self.validate_calendar(),
        }
    }

    fn validate_vertical(&self, legs: &[Leg]) -> Result<(), PositionError> {
        let mismatch = |detail: &str| PositionError::StructureMismatch {
            strategy: self.strategy,
            detail: detail.to_string(),
        };
        if legs[0].right != legs[1].right {
            return Err(mismatch("vertical legs must share a right"));
        }
        if legs[0].expiration != legs[1].expiration {
            return Err(mismatch("vertical legs must share an expiration"));
        }
        if legs[0].side == legs[1].side {
            return Err(mismatch("vertical needs one buy and one sell leg"));
        }
        if legs[0].strike == legs[1].strike {
            return Err(mismatch("vertical legs must have distinct strikes"));
        }
        Ok(())
    }

    fn validate_two_verticals(&self, shared_short_strike: bool) -> Result<(), PositionError> {
        let mismatch = |detail: &str| PositionError::StructureMismatch {
            strategy: self.strategy,
            detail: detail.to_string(),
        };
        let calls: Vec<&Leg> = self
            .legs
            .iter()
            .filter(|leg| leg.right == OptionRight::Call)
            .collect();
        let puts: Vec<&Leg> = self
            .legs
            .iter()
            .filter(|leg| leg.right == OptionRight::Put)
            .collect();
        if calls.len() != 2 || puts.len() != 2 {
            return Err(mismatch("expects two call legs and two put legs"));
        }
        if self
            .legs
            .iter()
            .any(|leg| leg.expiration != self.legs[0].expiration)
        {
            return Err(mismatch("all legs must share an expiration"));
        }
        for pair in [&calls, &puts] {
            if pair[0].side == pair[1].side {
                return Err(mismatch("each side must pair one buy and one sell leg"));
            }
            if pair[0].strike == pair[1].strike {
                return Err(mismatch("spread legs must have distinct strikes"));
            }
        }
        if shared_short_strike {
            let short_strikes: Vec<Decimal> = self
                .legs
                .iter()
                .filter(|leg| leg.side == LegSide::Sell)
                .map(|leg| leg.strike)
                .collect();
            if short_strikes.len() != 2 || short_strikes[0] != short_strikes[1] {
                return Err(mismatch("short call and short put must share a strike"));
            }
        }
        Ok(())
    }

    fn validate_calendar(&self) -> Result<(), PositionError> {
        let mismatch = |detail: &str| PositionError::StructureMismatch {
            strategy: self.strategy,
            detail: detail.to_string(),
        };
        let (near, far) = (&self.legs[0], &self.legs[1]);
        if near.right != far.right {
            return Err(mismatch("calendar legs must share a right"));
        }
        if near.strike != far.strike {
            return Err(mismatch("calendar legs must share a strike"));
        }
        if near.expiration == far.expiration {
            return Err(mismatch("calendar legs must differ in expiration"));
        }
        if near.side == far.side {
            return Err(mismatch("calendar needs one buy and one sell leg"));
        }
        Ok(())
    }

    /// Raw directional exposure: contracts × delta/contract × 100 shares.
    #[must_use]
    pub fn net_delta(&self) -> Decimal {
        Decimal::from(self.contracts) * self.delta_per_contract * Decimal::from(100)
    }

    /// Exposure normalized to the reference index.
    #[must_use]
    pub fn beta_weighted_delta(&self) -> Decimal {
        self.net_delta() * self.beta
    }

    /// Earliest leg expiration.
    #[must_use]
    pub fn earliest_expiration(&self) -> NaiveDate {
        // validate() guarantees at least one leg.
        self.legs
            .iter()
            .map(|leg| leg.expiration)
            .min()
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Days until the earliest leg expires.
    #[must_use]
    pub fn days_to_expiration(&self) -> i64 {
        (self.earliest_expiration() - Utc::now().date_naive()).num_days()
    }

    /// Short (sold) legs.
    pub fn short_legs(&self) -> impl Iterator<Item = &Leg> {
        self.legs.iter().filter(|leg| leg.side == LegSide::Sell)
    }

    /// True when the position was opened for a net credit.
    #[must_use]
    pub fn is_credit(&self) -> bool {
        self.entry_price > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(
        contract: i64,
        right: OptionRight,
        strike: Decimal,
        expiration: NaiveDate,
        side: LegSide,
    ) -> Leg {
        Leg {
            contract: ContractRef(contract),
            right,
            strike,
            expiration,
            side,
            ratio: 1,
        }
    }

    fn rules() -> ExitRules {
        ExitRules {
            take_profit_price: dec!(0.75),
            stop_loss_price: dec!(3.75),
            max_profit: dec!(150),
            max_loss: dec!(350),
        }
    }

    fn expiry(days: i64) -> NaiveDate {
        Utc::now().date_naive() + chrono::Duration::days(days)
    }

    fn condor_legs(expiration: NaiveDate) -> Vec<Leg> {
        vec![
            leg(1, OptionRight::Call, dec!(110), expiration, LegSide::Sell),
            leg(2, OptionRight::Call, dec!(115), expiration, LegSide::Buy),
            leg(3, OptionRight::Put, dec!(90), expiration, LegSide::Sell),
            leg(4, OptionRight::Put, dec!(85), expiration, LegSide::Buy),
        ]
    }

    #[test]
    fn iron_condor_constructs() {
        let position = Position::open(
            "spy",
            StrategyType::IronCondor,
            condor_legs(expiry(40)),
            2,
            dec!(1.50),
            rules(),
            dec!(-0.05),
            dec!(1.0),
        )
        .unwrap();
        assert_eq!(position.symbol, "SPY");
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.is_credit());
    }

    #[test]
    fn condor_rejects_wrong_leg_count() {
        let mut legs = condor_legs(expiry(40));
        legs.pop();
        let err = Position::open(
            "SPY",
            StrategyType::IronCondor,
            legs,
            1,
            dec!(1.50),
            rules(),
            dec!(-0.05),
            dec!(1.0),
        )
        .unwrap_err();
        assert!(matches!(err, PositionError::LegCountMismatch { .. }));
    }

    #[test]
    fn vertical_rejects_same_side_legs() {
        let expiration = expiry(30);
        let legs = vec![
            leg(1, OptionRight::Put, dec!(100), expiration, LegSide::Sell),
            leg(2, OptionRight::Put, dec!(95), expiration, LegSide::Sell),
        ];
        let err = Position::open(
            "QQQ",
            StrategyType::VerticalCredit,
            legs,
            1,
            dec!(1.10),
            rules(),
            dec!(0.10),
            dec!(1.1),
        )
        .unwrap_err();
        assert!(matches!(err, PositionError::StructureMismatch { .. }));
    }

    #[test]
    fn butterfly_requires_shared_short_strike() {
        let expiration = expiry(30);
        let legs = vec![
            leg(1, OptionRight::Call, dec!(105), expiration, LegSide::Sell),
            leg(2, OptionRight::Call, dec!(110), expiration, LegSide::Buy),
            leg(3, OptionRight::Put, dec!(100), expiration, LegSide::Sell),
            leg(4, OptionRight::Put, dec!(95), expiration, LegSide::Buy),
        ];
        let err = Position::open(
            "IWM",
            StrategyType::IronButterfly,
            legs,
            1,
            dec!(3.20),
            rules(),
            dec!(0.02),
            dec!(1.2),
        )
        .unwrap_err();
        assert!(matches!(err, PositionError::StructureMismatch { .. }));
    }

    #[test]
    fn calendar_requires_distinct_expirations() {
        let expiration = expiry(30);
        let legs = vec![
            leg(1, OptionRight::Call, dec!(100), expiration, LegSide::Sell),
            leg(2, OptionRight::Call, dec!(100), expiration, LegSide::Buy),
        ];
        let err = Position::open(
            "AAPL",
            StrategyType::Calendar,
            legs,
            1,
            dec!(-1.20),
            rules(),
            dec!(0.05),
            dec!(1.1),
        )
        .unwrap_err();
        assert!(matches!(err, PositionError::StructureMismatch { .. }));
    }

    #[test]
    fn zero_contracts_rejected() {
        let err = Position::open(
            "SPY",
            StrategyType::IronCondor,
            condor_legs(expiry(40)),
            0,
            dec!(1.50),
            rules(),
            dec!(-0.05),
            dec!(1.0),
        )
        .unwrap_err();
        assert_eq!(err, PositionError::ZeroContracts);
    }

    #[test]
    fn delta_aggregation_scales_by_contracts() {
        let position = Position::open(
            "SPY",
            StrategyType::IronCondor,
            condor_legs(expiry(40)),
            3,
            dec!(1.50),
            rules(),
            dec!(-0.05),
            dec!(1.2),
        )
        .unwrap();
        assert_eq!(position.net_delta(), dec!(-15)); // 3 × -0.05 × 100
        assert_eq!(position.beta_weighted_delta(), dec!(-18));
    }

    #[test]
    fn terminal_statuses() {
        assert!(PositionStatus::Closed.is_terminal());
        assert!(PositionStatus::Rolled.is_terminal());
        assert!(PositionStatus::ClosedExternally.is_terminal());
        assert!(PositionStatus::Expired.is_terminal());
        assert!(!PositionStatus::Open.is_terminal());
        assert!(!PositionStatus::Closing.is_terminal());
        assert!(!PositionStatus::Rolling.is_terminal());
    }

    #[test]
    fn exit_reason_display() {
        assert_eq!(ExitReason::StopLoss.to_string(), "stop_loss");
        assert_eq!(ExitReason::TimeExit.to_string(), "time_exit");
        assert_eq!(ExitReason::ExternalClose.to_string(), "external_close");
    }
}
