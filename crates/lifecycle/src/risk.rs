//! Portfolio-level exposure aggregation and new-trade gating.
//!
//! Pure aggregation with O(1) incremental updates. Business rejections
//! are returned as structured reasons, never raised as errors; the
//! caller decides what to do with a rejected proposal.

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use condor_core::config::RiskConfig;

use crate::position::Position;
use crate::store::PositionStore;

/// Exposure contributed by one position, recorded so removal subtracts
/// exactly what was added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Exposure {
    net: Decimal,
    beta_weighted: Decimal,
}

#[derive(Debug, Default)]
struct Aggregate {
    net_delta: Decimal,
    beta_weighted_delta: Decimal,
    bullish_delta: Decimal,
    bearish_delta: Decimal,
    ledger: HashMap<Uuid, Exposure>,
}

impl Aggregate {
    fn apply(&mut self, exposure: Exposure, sign: Decimal) {
        self.net_delta += exposure.net * sign;
        self.beta_weighted_delta += exposure.beta_weighted * sign;
        if exposure.beta_weighted >= Decimal::ZERO {
            self.bullish_delta += exposure.beta_weighted * sign;
        } else {
            self.bearish_delta += exposure.beta_weighted * sign;
        }
    }
}

/// Derived portfolio risk snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub net_delta: Decimal,
    pub beta_weighted_delta: Decimal,
    /// Positive (bullish) beta-weighted exposure.
    pub bullish_delta: Decimal,
    /// Negative (bearish) beta-weighted exposure.
    pub bearish_delta: Decimal,
    pub position_count: usize,
}

/// A proposed new trade, described by the exposure it would contribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    /// Net delta the trade would add: contracts × delta/contract × 100.
    pub net_delta: Decimal,
    pub beta: Decimal,
}

impl TradeProposal {
    /// Proposed exposure normalized to the reference index.
    #[must_use]
    pub fn beta_weighted_delta(&self) -> Decimal {
        self.net_delta * self.beta
    }
}

/// Which direction a concentration breach is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureDirection {
    Bullish,
    Bearish,
}

impl std::fmt::Display for ExposureDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

/// A structured rejection reason, carrying the projected value and the
/// limit it breached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskIssue {
    BetaWeightedCeiling { projected: Decimal, limit: Decimal },
    NetDeltaCeiling { projected: Decimal, limit: Decimal },
    DirectionalConcentration {
        direction: ExposureDirection,
        projected: Decimal,
        ceiling: Decimal,
    },
}

impl std::fmt::Display for RiskIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BetaWeightedCeiling { projected, limit } => {
                write!(f, "beta-weighted delta {projected} exceeds limit {limit}")
            }
            Self::NetDeltaCeiling { projected, limit } => {
                write!(f, "net delta {projected} exceeds limit {limit}")
            }
            Self::DirectionalConcentration {
                direction,
                projected,
                ceiling,
            } => write!(
                f,
                "{direction} exposure {projected} exceeds ceiling {ceiling}"
            ),
        }
    }
}

/// Outcome of a new-trade check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub issues: Vec<RiskIssue>,
    pub projected_beta_weighted_delta: Decimal,
    pub projected_net_delta: Decimal,
}

/// Maintains the derived exposure aggregate and gates new trades.
pub struct PortfolioRiskManager {
    config: RiskConfig,
    aggregate: RwLock<Aggregate>,
}

impl PortfolioRiskManager {
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            aggregate: RwLock::new(Aggregate::default()),
        }
    }

    /// Adds a position's exposure. Re-adding an already-tracked position
    /// replaces its prior contribution (cached-greeks refresh).
    pub fn add_position(&self, position: &Position) {
        let exposure = Exposure {
            net: position.net_delta(),
            beta_weighted: position.beta_weighted_delta(),
        };
        let mut aggregate = self.aggregate.write();
        if let Some(previous) = aggregate.ledger.remove(&position.id) {
            aggregate.apply(previous, Decimal::NEGATIVE_ONE);
        }
        aggregate.apply(exposure, Decimal::ONE);
        aggregate.ledger.insert(position.id, exposure);
        debug!(
            position_id = %position.id,
            symbol = position.symbol,
            net_delta = %exposure.net,
            beta_weighted_delta = %exposure.beta_weighted,
            "Exposure added"
        );
    }

    /// Removes a position's exposure, restoring the aggregate to exactly
    /// its prior values. Unknown ids are ignored.
    pub fn remove_position(&self, id: Uuid) {
        let mut aggregate = self.aggregate.write();
        if let Some(exposure) = aggregate.ledger.remove(&id) {
            aggregate.apply(exposure, Decimal::NEGATIVE_ONE);
            debug!(position_id = %id, "Exposure removed");
        }
    }

    /// Simulates the aggregate after adding `proposal` and reports every
    /// limit it would breach. Never mutates state.
    #[must_use]
    pub fn check_new_trade(&self, proposal: &TradeProposal) -> RiskDecision {
        let aggregate = self.aggregate.read();
        let proposed_bw = proposal.beta_weighted_delta();
        let projected_bw = aggregate.beta_weighted_delta + proposed_bw;
        let projected_net = aggregate.net_delta + proposal.net_delta;

        let mut issues = Vec::new();

        if projected_bw.abs() > self.config.max_beta_weighted_delta {
            issues.push(RiskIssue::BetaWeightedCeiling {
                projected: projected_bw,
                limit: self.config.max_beta_weighted_delta,
            });
        }

        if projected_net.abs() > self.config.max_net_delta {
            issues.push(RiskIssue::NetDeltaCeiling {
                projected: projected_net,
                limit: self.config.max_net_delta,
            });
        }

        let directional_ceiling =
            self.config.max_beta_weighted_delta * self.config.directional_fraction;
        if proposed_bw >= Decimal::ZERO {
            let projected_bullish = aggregate.bullish_delta + proposed_bw;
            if projected_bullish > directional_ceiling {
                issues.push(RiskIssue::DirectionalConcentration {
                    direction: ExposureDirection::Bullish,
                    projected: projected_bullish,
                    ceiling: directional_ceiling,
                });
            }
        } else {
            let projected_bearish = aggregate.bearish_delta + proposed_bw;
            if projected_bearish.abs() > directional_ceiling {
                issues.push(RiskIssue::DirectionalConcentration {
                    direction: ExposureDirection::Bearish,
                    projected: projected_bearish.abs(),
                    ceiling: directional_ceiling,
                });
            }
        }

        let approved = issues.is_empty();
        if approved {
            info!(
                symbol = proposal.symbol,
                proposed_bw = %proposed_bw,
                projected_bw = %projected_bw,
                "Trade approved by risk check"
            );
        } else {
            warn!(
                symbol = proposal.symbol,
                issues = issues.len(),
                projected_bw = %projected_bw,
                "Trade rejected by risk check"
            );
        }

        RiskDecision {
            approved,
            issues,
            projected_beta_weighted_delta: projected_bw,
            projected_net_delta: projected_net,
        }
    }

    /// Full rebuild from the store's non-terminal positions.
    ///
    /// Used after reconciliation, and as the backstop that guarantees
    /// eventual consistency if an incremental update was ever missed.
    pub fn recompute_from_store(&self, store: &PositionStore) {
        let open = store.list_open();
        let mut aggregate = self.aggregate.write();
        *aggregate = Aggregate::default();
        for position in &open {
            let exposure = Exposure {
                net: position.net_delta(),
                beta_weighted: position.beta_weighted_delta(),
            };
            aggregate.apply(exposure, Decimal::ONE);
            aggregate.ledger.insert(position.id, exposure);
        }
        info!(positions = open.len(), "Risk aggregate rebuilt from store");
    }

    #[must_use]
    pub fn snapshot(&self) -> RiskSnapshot {
        let aggregate = self.aggregate.read();
        RiskSnapshot {
            net_delta: aggregate.net_delta,
            beta_weighted_delta: aggregate.beta_weighted_delta,
            bullish_delta: aggregate.bullish_delta,
            bearish_delta: aggregate.bearish_delta,
            position_count: aggregate.ledger.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ExitRules, Leg, LegSide, StrategyType};
    use chrono::Utc;
    use condor_gateway::types::{ContractRef, OptionRight};
    use rust_decimal_macros::dec;

    fn limits() -> RiskConfig {
        RiskConfig {
            max_beta_weighted_delta: dec!(100),
            max_net_delta: dec!(50),
            directional_fraction: dec!(0.80),
        }
    }

    fn make_position(delta_per_contract: Decimal, contracts: u32, beta: Decimal) -> Position {
        let expiration = Utc::now().date_naive() + chrono::Duration::days(35);
        Position::open(
            "SPY",
            StrategyType::VerticalCredit,
            vec![
                Leg {
                    contract: ContractRef(21),
                    right: OptionRight::Put,
                    strike: dec!(550),
                    expiration,
                    side: LegSide::Sell,
                    ratio: 1,
                },
                Leg {
                    contract: ContractRef(22),
                    right: OptionRight::Put,
                    strike: dec!(545),
                    expiration,
                    side: LegSide::Buy,
                    ratio: 1,
                },
            ],
            contracts,
            dec!(1.50),
            ExitRules {
                take_profit_price: dec!(0.75),
                stop_loss_price: dec!(3.75),
                max_profit: dec!(150),
                max_loss: dec!(350),
            },
            delta_per_contract,
            beta,
        )
        .unwrap()
    }

    #[test]
    fn add_remove_round_trip_is_exact() {
        let risk = PortfolioRiskManager::new(limits());
        risk.add_position(&make_position(dec!(0.11), 2, dec!(1.3)));
        let before = risk.snapshot();

        let position = make_position(dec!(-0.07), 3, dec!(0.9));
        risk.add_position(&position);
        assert_ne!(risk.snapshot(), before);

        risk.remove_position(position.id);
        assert_eq!(risk.snapshot(), before);
    }

    #[test]
    fn rejects_beta_weighted_breach_with_amount() {
        let risk = PortfolioRiskManager::new(limits());
        // Seed aggregate at 75 beta-weighted.
        risk.add_position(&make_position(dec!(0.25), 3, dec!(1.0)));
        assert_eq!(risk.snapshot().beta_weighted_delta, dec!(75));

        let decision = risk.check_new_trade(&TradeProposal {
            symbol: "QQQ".to_string(),
            net_delta: dec!(40),
            beta: dec!(1.0),
        });

        assert!(!decision.approved);
        assert!(decision.issues.contains(&RiskIssue::BetaWeightedCeiling {
            projected: dec!(115),
            limit: dec!(100),
        }));
    }

    #[test]
    fn rejects_directional_concentration() {
        let config = RiskConfig {
            max_beta_weighted_delta: dec!(100),
            max_net_delta: dec!(1000),
            directional_fraction: dec!(0.80),
        };
        let risk = PortfolioRiskManager::new(config);
        // Bullish 50 already on.
        risk.add_position(&make_position(dec!(0.25), 2, dec!(1.0)));
        assert_eq!(risk.snapshot().bullish_delta, dec!(50));

        // +35 keeps total beta-weighted under 100 but pushes bullish past 80.
        let decision = risk.check_new_trade(&TradeProposal {
            symbol: "QQQ".to_string(),
            net_delta: dec!(35),
            beta: dec!(1.0),
        });

        assert!(!decision.approved);
        assert!(matches!(
            decision.issues[0],
            RiskIssue::DirectionalConcentration {
                direction: ExposureDirection::Bullish,
                ..
            }
        ));
    }

    #[test]
    fn check_never_mutates() {
        let risk = PortfolioRiskManager::new(limits());
        risk.add_position(&make_position(dec!(0.10), 1, dec!(1.0)));
        let before = risk.snapshot();

        let _ = risk.check_new_trade(&TradeProposal {
            symbol: "IWM".to_string(),
            net_delta: dec!(500),
            beta: dec!(1.0),
        });

        assert_eq!(risk.snapshot(), before);
    }

    #[test]
    fn re_adding_replaces_prior_contribution() {
        let risk = PortfolioRiskManager::new(limits());
        let mut position = make_position(dec!(0.10), 1, dec!(1.0));
        risk.add_position(&position);
        assert_eq!(risk.snapshot().net_delta, dec!(10));

        // Refreshed greeks: same position, new delta.
        position.delta_per_contract = dec!(0.20);
        risk.add_position(&position);
        assert_eq!(risk.snapshot().net_delta, dec!(20));
        assert_eq!(risk.snapshot().position_count, 1);
    }

    #[test]
    fn recompute_from_store_matches_incremental() {
        let store = PositionStore::new();
        let risk = PortfolioRiskManager::new(limits());

        let a = make_position(dec!(0.10), 2, dec!(1.1));
        let b = make_position(dec!(-0.05), 1, dec!(0.8));
        risk.add_position(&a);
        risk.add_position(&b);
        store.create(a).unwrap();
        store.create(b).unwrap();

        let incremental = risk.snapshot();
        risk.recompute_from_store(&store);
        assert_eq!(risk.snapshot(), incremental);
    }
}
