//! Exit monitor — evaluates open positions against exit rules and
//! drives atomic closes.
//!
//! Rules fire in strict priority order — stop loss, forced time exit,
//! take profit, advisory signal — and the first match wins. A matched
//! rule submits one atomic closing order for all legs; a timeout leaves
//! the position `Open` for the next cycle, and a fill that does not
//! match the submitted leg set freezes the position for manual
//! reconciliation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use condor_core::config::{AppConfig, ExitConfig};
use condor_gateway::error::GatewayError;
use condor_gateway::traits::{AdvisoryService, MarketData, OrderGateway};
use condor_gateway::types::AdvisoryVerdict;

use crate::orders;
use crate::position::{ExitReason, ExitRules, LegSide, Position, PositionStatus, ReviewReason};
use crate::risk::PortfolioRiskManager;
use crate::store::{OperationGuard, PositionStore, TransitionFields};

/// Net cost to close a position per combo unit, composed from per-leg
/// mid quotes. Positive when closing requires paying (credit
/// structures), negative when closing pays out (debit structures).
pub async fn closing_cost<M: MarketData>(
    market: &M,
    position: &Position,
) -> condor_gateway::error::Result<Decimal> {
    let mut cost = Decimal::ZERO;
    for leg in &position.legs {
        let quote = market.option_quote(leg.contract).await?;
        let signed = match leg.side {
            LegSide::Sell => quote.mid(),
            LegSide::Buy => -quote.mid(),
        };
        cost += signed * Decimal::from(leg.ratio);
    }
    Ok(cost)
}

/// Position delta per combo unit, composed from per-leg greeks.
pub async fn position_delta<M: MarketData>(
    market: &M,
    position: &Position,
) -> condor_gateway::error::Result<Decimal> {
    let mut delta = Decimal::ZERO;
    for leg in &position.legs {
        let greeks = market.greeks(leg.contract).await?;
        let signed = match leg.side {
            LegSide::Buy => greeks.delta,
            LegSide::Sell => -greeks.delta,
        };
        delta += signed * Decimal::from(leg.ratio);
    }
    Ok(delta)
}

/// Signed unrealized P&L as a fraction of entry premium.
#[must_use]
pub fn unrealized_pnl_pct(position: &Position, closing_cost: Decimal) -> Decimal {
    if position.entry_price.is_zero() {
        return Decimal::ZERO;
    }
    if position.is_credit() {
        (position.entry_price - closing_cost) / position.entry_price
    } else {
        let entry_paid = -position.entry_price;
        let value = -closing_cost;
        (value - entry_paid) / entry_paid
    }
}

/// Exit rules derived from a position's entry premium, using the
/// configured take-profit fraction and stop-loss multiplier.
#[must_use]
pub fn derive_exit_rules(entry_price: Decimal, contracts: u32, config: &ExitConfig) -> ExitRules {
    let multiplier = Decimal::from(100) * Decimal::from(contracts);
    if entry_price >= Decimal::ZERO {
        let take_profit_price = entry_price * config.take_profit_fraction;
        let stop_loss_price = entry_price * config.stop_loss_multiplier;
        ExitRules {
            take_profit_price,
            stop_loss_price,
            max_profit: entry_price * multiplier,
            max_loss: (stop_loss_price - entry_price) * multiplier,
        }
    } else {
        // Debit: thresholds on the spread's value.
        let paid = -entry_price;
        let take_profit_price = paid * (Decimal::ONE + config.take_profit_fraction);
        let stop_loss_price = paid * (Decimal::ONE - config.take_profit_fraction);
        ExitRules {
            take_profit_price,
            stop_loss_price,
            max_profit: (take_profit_price - paid) * multiplier,
            max_loss: paid * multiplier,
        }
    }
}

/// Evaluates the exit rules for one position in strict priority order.
/// First match wins; no rule stacking.
#[must_use]
pub fn evaluate_exit(
    position: &Position,
    closing_cost: Decimal,
    advisory: Option<AdvisoryVerdict>,
    config: &ExitConfig,
) -> Option<ExitReason> {
    // Credit structures are measured by the cost to buy back; debit
    // structures by their liquidation value.
    let metric = if position.is_credit() {
        closing_cost
    } else {
        -closing_cost
    };
    let rules = &position.exit_rules;

    // 1. Stop loss breached.
    let stop_breached = if position.is_credit() {
        metric >= rules.stop_loss_price
    } else {
        metric <= rules.stop_loss_price
    };
    if stop_breached {
        return Some(ExitReason::StopLoss);
    }

    // 2. Forced time exit at the DTE floor.
    if position.days_to_expiration() <= config.time_exit_dte {
        return Some(ExitReason::TimeExit);
    }

    // 3. Take profit reached.
    let target_hit = if position.is_credit() {
        metric <= rules.take_profit_price
    } else {
        metric >= rules.take_profit_price
    };
    if target_hit {
        return Some(ExitReason::ProfitTarget);
    }

    // 4. Advisory exit signal.
    if config.advisory_exits_enabled {
        if let Some(verdict) = advisory {
            if verdict.approved {
                return Some(ExitReason::AdvisoryExit);
            }
        }
    }

    None
}

/// Periodic task that closes positions whose exit rules have matched.
pub struct ExitMonitor<G, M, A> {
    store: Arc<PositionStore>,
    risk: Arc<PortfolioRiskManager>,
    gateway: Arc<G>,
    market: Arc<M>,
    advisory: Arc<A>,
    config: AppConfig,
}

impl<G, M, A> ExitMonitor<G, M, A>
where
    G: OrderGateway,
    M: MarketData,
    A: AdvisoryService,
{
    pub fn new(
        store: Arc<PositionStore>,
        risk: Arc<PortfolioRiskManager>,
        gateway: Arc<G>,
        market: Arc<M>,
        advisory: Arc<A>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            risk,
            gateway,
            market,
            advisory,
            config,
        }
    }

    /// One monitor pass over every actionable position. Returns the
    /// number of positions closed.
    pub async fn run_once(&self) -> Result<u32> {
        let mut closed = 0;
        for position in self.store.list_actionable() {
            match self.process_position(&position).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    position_id = %position.id,
                    symbol = position.symbol,
                    error = %e,
                    "Exit evaluation failed; will retry next cycle"
                ),
            }
        }
        Ok(closed)
    }

    async fn process_position(&self, position: &Position) -> Result<bool> {
        // Positions past expiration leave the book without an order.
        if position.days_to_expiration() < 0 {
            let Some(guard) = self.store.try_begin_operation(position.id) else {
                return Ok(false);
            };
            self.store.transition(
                &guard,
                PositionStatus::Expired,
                TransitionFields::exited(ExitReason::Expired),
            )?;
            self.risk.remove_position(position.id);
            info!(position_id = %position.id, symbol = position.symbol, "Position expired");
            return Ok(false);
        }

        let cost = match closing_cost(self.market.as_ref(), position).await {
            Ok(cost) => cost,
            Err(e) if e.is_transient() => {
                debug!(position_id = %position.id, error = %e, "Quote unavailable; skipping this cycle");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        // Refresh cached risk inputs while we have the market's attention.
        if let Ok(delta) = position_delta(self.market.as_ref(), position).await {
            if let Ok(updated) = self
                .store
                .update_risk_inputs(position.id, delta, position.beta)
            {
                self.risk.add_position(&updated);
            }
        }

        let advisory = if self.config.exit.advisory_exits_enabled {
            self.advisory
                .exit_signal(&position.symbol, unrealized_pnl_pct(position, cost))
                .await
                .unwrap_or(None)
        } else {
            None
        };

        let Some(reason) = evaluate_exit(position, cost, advisory, &self.config.exit) else {
            return Ok(false);
        };

        let Some(guard) = self.store.try_begin_operation(position.id) else {
            debug!(position_id = %position.id, "Another operation in flight; deferring exit");
            return Ok(false);
        };

        info!(
            position_id = %position.id,
            symbol = position.symbol,
            reason = %reason,
            closing_cost = %cost,
            "Exit rule matched; submitting atomic close"
        );
        self.execute_close(&guard, position, reason).await
    }

    async fn execute_close(
        &self,
        guard: &OperationGuard,
        position: &Position,
        reason: ExitReason,
    ) -> Result<bool> {
        self.store
            .transition(guard, PositionStatus::Closing, TransitionFields::default())?;

        let order = orders::closing_order(position);
        let outcome = orders::submit_and_await(
            self.gateway.as_ref(),
            &order,
            Duration::from_secs(self.config.engine.fill_timeout_secs),
            Duration::from_millis(self.config.engine.order_poll_interval_ms),
        )
        .await;

        match outcome {
            Ok(report) => {
                self.store
                    .transition(guard, PositionStatus::Closed, TransitionFields::exited(reason))?;
                self.risk.remove_position(position.id);
                info!(
                    position_id = %position.id,
                    symbol = position.symbol,
                    reason = %reason,
                    avg_price = %report.avg_price,
                    "Position closed"
                );
                Ok(true)
            }
            Err(e @ GatewayError::OrderTimeout { .. }) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                warn!(position_id = %position.id, error = %e, "Close not filled in time; will retry next cycle");
                Ok(false)
            }
            Err(e @ GatewayError::PartialFillMismatch { .. }) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                self.store
                    .flag_for_review(position.id, ReviewReason::PartialFillMismatch)?;
                error!(
                    position_id = %position.id,
                    error = %e,
                    "Fill did not match submitted legs; position frozen for manual reconciliation"
                );
                Ok(false)
            }
            Err(e) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                warn!(position_id = %position.id, error = %e, "Close attempt failed; will retry next cycle");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{ExitRules, Leg, StrategyType};
    use chrono::Utc;
    use condor_core::config::RiskConfig;
    use condor_gateway::paper::{FillMode, PaperGateway};
    use condor_gateway::types::{ContractRef, OptionRight, Quote};
    use rust_decimal_macros::dec;

    fn make_spread(dte: i64, entry_price: Decimal, stop: Decimal, target: Decimal) -> Position {
        let expiration = Utc::now().date_naive() + chrono::Duration::days(dte);
        Position::open(
            "SPY",
            if entry_price > Decimal::ZERO {
                StrategyType::VerticalCredit
            } else {
                StrategyType::VerticalDebit
            },
            vec![
                Leg {
                    contract: ContractRef(101),
                    right: OptionRight::Put,
                    strike: dec!(550),
                    expiration,
                    side: LegSide::Sell,
                    ratio: 1,
                },
                Leg {
                    contract: ContractRef(102),
                    right: OptionRight::Put,
                    strike: dec!(545),
                    expiration,
                    side: LegSide::Buy,
                    ratio: 1,
                },
            ],
            1,
            entry_price,
            ExitRules {
                take_profit_price: target,
                stop_loss_price: stop,
                max_profit: dec!(150),
                max_loss: dec!(350),
            },
            dec!(0.12),
            dec!(1.0),
        )
        .unwrap()
    }

    fn exit_config() -> ExitConfig {
        ExitConfig::default()
    }

    // ==================== Rule Priority Tests ====================

    #[test]
    fn stop_loss_fires_on_breach() {
        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let reason = evaluate_exit(&position, dec!(4.00), None, &exit_config());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn stop_loss_beats_time_exit() {
        // 5 DTE and stop breached: stop loss wins by priority.
        let position = make_spread(5, dec!(1.50), dec!(3.75), dec!(0.75));
        let reason = evaluate_exit(&position, dec!(4.00), None, &exit_config());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn time_exit_beats_take_profit() {
        // 5 DTE and profitable: the forced time exit still wins.
        let position = make_spread(5, dec!(1.50), dec!(3.75), dec!(0.75));
        let reason = evaluate_exit(&position, dec!(0.50), None, &exit_config());
        assert_eq!(reason, Some(ExitReason::TimeExit));
    }

    #[test]
    fn take_profit_fires_when_cost_collapses() {
        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let reason = evaluate_exit(&position, dec!(0.60), None, &exit_config());
        assert_eq!(reason, Some(ExitReason::ProfitTarget));
    }

    #[test]
    fn advisory_exit_fires_last() {
        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let verdict = AdvisoryVerdict {
            approved: true,
            confidence: 9,
        };
        let reason = evaluate_exit(&position, dec!(1.40), Some(verdict), &exit_config());
        assert_eq!(reason, Some(ExitReason::AdvisoryExit));
    }

    #[test]
    fn no_rule_matches_inside_the_band() {
        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let reason = evaluate_exit(&position, dec!(1.40), None, &exit_config());
        assert_eq!(reason, None);
    }

    #[test]
    fn debit_spread_stop_mirrors() {
        // Paid 2.00; stop at value 1.00. Value falls to 0.90 -> stop.
        let position = make_spread(30, dec!(-2.00), dec!(1.00), dec!(3.00));
        let reason = evaluate_exit(&position, dec!(-0.90), None, &exit_config());
        assert_eq!(reason, Some(ExitReason::StopLoss));
    }

    #[test]
    fn pnl_pct_signs() {
        let credit = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        assert!(unrealized_pnl_pct(&credit, dec!(0.75)) > Decimal::ZERO);
        assert!(unrealized_pnl_pct(&credit, dec!(3.00)) < Decimal::ZERO);
    }

    // ==================== Execution Tests ====================

    struct Fixture {
        store: Arc<PositionStore>,
        risk: Arc<PortfolioRiskManager>,
        gateway: Arc<PaperGateway>,
        monitor: ExitMonitor<PaperGateway, PaperGateway, PaperGateway>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PositionStore::new());
        let risk = Arc::new(PortfolioRiskManager::new(RiskConfig::default()));
        let gateway = Arc::new(PaperGateway::new());
        let mut config = AppConfig::default();
        config.engine.fill_timeout_secs = 0;
        config.engine.order_poll_interval_ms = 1;
        let monitor = ExitMonitor::new(
            Arc::clone(&store),
            Arc::clone(&risk),
            Arc::clone(&gateway),
            Arc::clone(&gateway),
            Arc::clone(&gateway),
            config,
        );
        Fixture {
            store,
            risk,
            gateway,
            monitor,
        }
    }

    fn seed_quotes(gateway: &PaperGateway, short_mid: Decimal, long_mid: Decimal) {
        gateway.set_option_quote(
            ContractRef(101),
            Quote {
                bid: short_mid,
                ask: short_mid,
                last: short_mid,
            },
        );
        gateway.set_option_quote(
            ContractRef(102),
            Quote {
                bid: long_mid,
                ask: long_mid,
                last: long_mid,
            },
        );
    }

    #[tokio::test]
    async fn stop_loss_scenario_closes_and_removes_exposure() {
        let fixture = fixture();
        // Stop at 3.75; closing cost composes to 4.50 - 0.50 = 4.00.
        seed_quotes(&fixture.gateway, dec!(4.50), dec!(0.50));
        fixture.gateway.set_fill_price(dec!(3.80));

        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let id = position.id;
        fixture.risk.add_position(&position);
        fixture.store.create(position).unwrap();

        let closed = fixture.monitor.run_once().await.unwrap();
        assert_eq!(closed, 1);

        let stored = fixture.store.get(id).unwrap();
        assert_eq!(stored.status, PositionStatus::Closed);
        assert_eq!(stored.exit_reason, Some(ExitReason::StopLoss));
        assert!(stored.exit_time.is_some());
        assert_eq!(fixture.risk.snapshot().position_count, 0);
    }

    #[tokio::test]
    async fn timeout_leaves_position_open() {
        let fixture = fixture();
        seed_quotes(&fixture.gateway, dec!(4.50), dec!(0.50));
        fixture.gateway.set_fill_mode(FillMode::Hold);

        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let id = position.id;
        fixture.risk.add_position(&position);
        fixture.store.create(position).unwrap();

        let closed = fixture.monitor.run_once().await.unwrap();
        assert_eq!(closed, 0);

        let stored = fixture.store.get(id).unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
        assert!(stored.review.is_none());
        // Exposure untouched; close retries next cycle.
        assert_eq!(fixture.risk.snapshot().position_count, 1);
        // The guard was released for the next cycle.
        assert!(fixture.store.try_begin_operation(id).is_some());
    }

    #[tokio::test]
    async fn mismatched_fill_freezes_position() {
        let fixture = fixture();
        seed_quotes(&fixture.gateway, dec!(4.50), dec!(0.50));
        fixture.gateway.set_fill_mode(FillMode::DropLastLeg);

        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let id = position.id;
        fixture.store.create(position).unwrap();

        fixture.monitor.run_once().await.unwrap();

        let stored = fixture.store.get(id).unwrap();
        assert_eq!(stored.status, PositionStatus::Open);
        assert_eq!(stored.review, Some(ReviewReason::PartialFillMismatch));
        // Frozen: no longer actionable.
        assert!(fixture.store.list_actionable().is_empty());
    }

    #[tokio::test]
    async fn expired_position_is_swept() {
        let fixture = fixture();
        let position = make_spread(-1, dec!(1.50), dec!(3.75), dec!(0.75));
        let id = position.id;
        fixture.risk.add_position(&position);
        fixture.store.create(position).unwrap();

        fixture.monitor.run_once().await.unwrap();

        let stored = fixture.store.get(id).unwrap();
        assert_eq!(stored.status, PositionStatus::Expired);
        assert_eq!(stored.exit_reason, Some(ExitReason::Expired));
        assert_eq!(fixture.risk.snapshot().position_count, 0);
    }

    #[tokio::test]
    async fn missing_quotes_skip_the_cycle() {
        let fixture = fixture();
        // No quotes seeded at all.
        let position = make_spread(30, dec!(1.50), dec!(3.75), dec!(0.75));
        let id = position.id;
        fixture.store.create(position).unwrap();

        let closed = fixture.monitor.run_once().await.unwrap();
        assert_eq!(closed, 0);
        assert_eq!(fixture.store.get(id).unwrap().status, PositionStatus::Open);
    }
}
