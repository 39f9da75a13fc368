//! Roll manager — detects challenged positions and executes defensive
//! rolls as a single atomic multi-leg transaction.
//!
//! A roll closes the old legs and opens the replacement legs in ONE
//! combo order. Submitting the close and the open separately is never
//! acceptable: a broker confirming only the close would leave exposure
//! incorrectly flattened, or naked with no compensating premium. Every
//! replacement leg is resolved and validated before any order is built;
//! if one cannot be resolved, the roll aborts with the old position
//! untouched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use condor_core::config::{AppConfig, RollConfig};
use condor_gateway::error::GatewayError;
use condor_gateway::traits::{AdvisoryService, MarketData, OrderGateway};
use condor_gateway::types::{ComboOrder, ContractSpec, OptionRight, OrderLeg, OrderType};

use crate::exit::{self, derive_exit_rules};
use crate::orders;
use crate::position::{
    ExitReason, Leg, LegSide, LegSpec, Position, PositionStatus, ReviewReason, StrategyType,
};
use crate::risk::PortfolioRiskManager;
use crate::store::{OperationGuard, PositionStore, TransitionFields};

/// Which condition put the position on the roll path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollTrigger {
    /// Underlying within the configured proximity of a short strike.
    StrikeTested {
        right: OptionRight,
        strike: Decimal,
        distance_pct: Decimal,
    },
    /// Absolute delta of the tested short leg past the breach threshold.
    DeltaBreach {
        right: OptionRight,
        strike: Decimal,
        delta: Decimal,
    },
    /// DTE under the floor with unfavorable greeks on the short side.
    TimeDecay { dte: i64 },
}

/// How the replacement legs relate to the old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollType {
    /// Call side tested: call-spread strikes shift up one spread-width,
    /// expiration extends.
    UpAndOut,
    /// Put side tested: put-spread strikes shift down one spread-width,
    /// expiration extends.
    DownAndOut,
    /// Time trigger only: strikes preserved, expiration extends.
    Out,
}

impl std::fmt::Display for RollType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UpAndOut => "roll_up_and_out",
            Self::DownAndOut => "roll_down_and_out",
            Self::Out => "roll_out",
        };
        write!(f, "{name}")
    }
}

/// A fully computed roll, ready for resolution and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollPlan {
    pub trigger: RollTrigger,
    pub roll_type: RollType,
    pub new_expiration: NaiveDate,
    pub replacement_legs: Vec<LegSpec>,
}

/// The short leg closest to the money, with its strike distance as a
/// fraction of the strike.
#[must_use]
pub fn nearest_short_leg(position: &Position, underlying: Decimal) -> Option<(&Leg, Decimal)> {
    position
        .short_legs()
        .filter(|leg| !leg.strike.is_zero())
        .map(|leg| (leg, ((underlying - leg.strike) / leg.strike).abs()))
        .min_by(|a, b| a.1.cmp(&b.1))
}

/// Evaluates the roll triggers for one position.
///
/// `tested_delta` is the live delta of the short leg closest to the
/// money.
#[must_use]
pub fn detect_roll_trigger(
    position: &Position,
    underlying: Decimal,
    tested_delta: Decimal,
    config: &RollConfig,
) -> Option<RollTrigger> {
    let (leg, distance_pct) = nearest_short_leg(position, underlying)?;

    if distance_pct < config.strike_proximity_pct {
        return Some(RollTrigger::StrikeTested {
            right: leg.right,
            strike: leg.strike,
            distance_pct,
        });
    }

    if tested_delta.abs() > config.delta_breach_threshold {
        return Some(RollTrigger::DeltaBreach {
            right: leg.right,
            strike: leg.strike,
            delta: tested_delta,
        });
    }

    let dte = position.days_to_expiration();
    if dte < config.dte_floor && tested_delta.abs() >= config.delta_breach_threshold / Decimal::from(2)
    {
        return Some(RollTrigger::TimeDecay { dte });
    }

    None
}

/// Maps a trigger to the roll direction.
#[must_use]
pub fn classify_roll(trigger: RollTrigger) -> RollType {
    match trigger {
        RollTrigger::StrikeTested {
            right: OptionRight::Call,
            ..
        }
        | RollTrigger::DeltaBreach {
            right: OptionRight::Call,
            ..
        } => RollType::UpAndOut,
        RollTrigger::StrikeTested {
            right: OptionRight::Put,
            ..
        }
        | RollTrigger::DeltaBreach {
            right: OptionRight::Put,
            ..
        } => RollType::DownAndOut,
        RollTrigger::TimeDecay { .. } => RollType::Out,
    }
}

/// Nearest listed expiration with at least `target_min_dte` days left.
#[must_use]
pub fn select_expiration(
    expirations: &[NaiveDate],
    today: NaiveDate,
    target_min_dte: i64,
) -> Option<NaiveDate> {
    expirations
        .iter()
        .copied()
        .filter(|date| (*date - today).num_days() >= target_min_dte)
        .min()
}

/// Spread width between the legs of one right, zero when the right has
/// fewer than two legs.
fn spread_width(position: &Position, right: OptionRight) -> Decimal {
    let strikes: Vec<Decimal> = position
        .legs
        .iter()
        .filter(|leg| leg.right == right)
        .map(|leg| leg.strike)
        .collect();
    match (strikes.iter().min(), strikes.iter().max()) {
        (Some(min), Some(max)) if strikes.len() >= 2 => *max - *min,
        _ => Decimal::ZERO,
    }
}

/// Computes the replacement leg set for a roll.
///
/// Strikes on the tested side shift by one spread-width; the untested
/// side keeps its strikes. Only legs at the position's nearest
/// expiration extend (a calendar's back leg is preserved).
#[must_use]
pub fn compute_replacement_legs(
    position: &Position,
    roll_type: RollType,
    new_expiration: NaiveDate,
) -> Vec<LegSpec> {
    let near_expiration = position.earliest_expiration();
    let call_width = spread_width(position, OptionRight::Call);
    let put_width = spread_width(position, OptionRight::Put);

    position
        .legs
        .iter()
        .map(|leg| {
            // A butterfly recenters: both sides shift together so the
            // shorts keep their shared strike.
            let strike = match (position.strategy, roll_type, leg.right) {
                (StrategyType::IronButterfly, RollType::UpAndOut, _) => leg.strike + call_width,
                (StrategyType::IronButterfly, RollType::DownAndOut, _) => leg.strike - put_width,
                (_, RollType::UpAndOut, OptionRight::Call) => leg.strike + call_width,
                (_, RollType::DownAndOut, OptionRight::Put) => leg.strike - put_width,
                _ => leg.strike,
            };
            let expiration = if leg.expiration == near_expiration {
                new_expiration
            } else {
                leg.expiration
            };
            LegSpec {
                right: leg.right,
                strike,
                expiration,
                side: leg.side,
                ratio: leg.ratio,
            }
        })
        .collect()
}

/// Periodic task that rolls challenged positions.
pub struct RollManager<G, M, A> {
    store: Arc<PositionStore>,
    risk: Arc<PortfolioRiskManager>,
    gateway: Arc<G>,
    market: Arc<M>,
    advisory: Arc<A>,
    config: AppConfig,
}

impl<G, M, A> RollManager<G, M, A>
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

    /// One manager pass over every actionable position. Returns the ids
    /// of the positions created by successful rolls.
    pub async fn run_once(&self) -> Result<Vec<Uuid>> {
        let mut rolled = Vec::new();
        for position in self.store.list_actionable() {
            match self.process_position(&position).await {
                Ok(Some(new_id)) => rolled.push(new_id),
                Ok(None) => {}
                Err(e) => warn!(
                    position_id = %position.id,
                    symbol = position.symbol,
                    error = %e,
                    "Roll evaluation failed; will retry next cycle"
                ),
            }
        }
        Ok(rolled)
    }

    async fn process_position(&self, position: &Position) -> Result<Option<Uuid>> {
        let underlying = match self.market.quote(&position.symbol).await {
            Ok(quote) => quote.mid(),
            Err(e) if e.is_transient() => {
                debug!(position_id = %position.id, error = %e, "Underlying quote unavailable; skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let tested_delta = match nearest_short_leg(position, underlying) {
            Some((leg, _)) => self
                .market
                .greeks(leg.contract)
                .await
                .map(|greeks| greeks.delta)
                .unwrap_or(Decimal::ZERO),
            None => return Ok(None),
        };

        let Some(trigger) =
            detect_roll_trigger(position, underlying, tested_delta, &self.config.roll)
        else {
            return Ok(None);
        };

        // Close takes priority over roll: if an exit rule would fire on
        // this position, leave it for the exit monitor.
        if let Ok(cost) = exit::closing_cost(self.market.as_ref(), position).await {
            if exit::evaluate_exit(position, cost, None, &self.config.exit).is_some() {
                debug!(
                    position_id = %position.id,
                    "Exit rule pending; deferring roll to the exit monitor"
                );
                return Ok(None);
            }
        }

        let expirations = match self.market.expirations(&position.symbol).await {
            Ok(expirations) => expirations,
            Err(e) if e.is_transient() => {
                debug!(position_id = %position.id, error = %e, "Expirations unavailable; skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let today = Utc::now().date_naive();
        let Some(new_expiration) =
            select_expiration(&expirations, today, self.config.roll.target_min_dte)
        else {
            warn!(
                position_id = %position.id,
                symbol = position.symbol,
                "No listed expiration satisfies the roll DTE floor"
            );
            return Ok(None);
        };

        let roll_type = classify_roll(trigger);
        let plan = RollPlan {
            trigger,
            roll_type,
            new_expiration,
            replacement_legs: compute_replacement_legs(position, roll_type, new_expiration),
        };

        let Some(guard) = self.store.try_begin_operation(position.id) else {
            debug!(position_id = %position.id, "Another operation in flight; deferring roll");
            return Ok(None);
        };

        info!(
            position_id = %position.id,
            symbol = position.symbol,
            roll_type = %plan.roll_type,
            new_expiration = %plan.new_expiration,
            trigger = ?plan.trigger,
            "Roll trigger matched; executing atomic roll"
        );
        self.execute_roll(&guard, position, &plan).await
    }

    /// Executes a roll as one indivisible close-old/open-new order.
    ///
    /// Exactly two outcomes are observable: the old position is `Rolled`
    /// and a new linked position exists with the planned legs, or the
    /// old position is unchanged and nothing was created.
    async fn execute_roll(
        &self,
        guard: &OperationGuard,
        position: &Position,
        plan: &RollPlan,
    ) -> Result<Option<Uuid>> {
        // Resolve every replacement leg before any order is built.
        let mut new_legs = Vec::with_capacity(plan.replacement_legs.len());
        for leg_plan in &plan.replacement_legs {
            let spec = ContractSpec::new(
                &position.symbol,
                leg_plan.expiration,
                leg_plan.strike,
                leg_plan.right,
            );
            match self.gateway.resolve_contract(&spec).await {
                Ok(contract) => new_legs.push(Leg {
                    contract,
                    right: leg_plan.right,
                    strike: leg_plan.strike,
                    expiration: leg_plan.expiration,
                    side: leg_plan.side,
                    ratio: leg_plan.ratio,
                }),
                Err(e) => {
                    error!(
                        position_id = %position.id,
                        spec = %spec.display_name(),
                        error = %e,
                        "Replacement leg unresolvable; roll aborted, position untouched"
                    );
                    return Ok(None);
                }
            }
        }

        // Net premium the replacement structure opens for, from current
        // quotes. Needed as the new position's entry price.
        let mut new_entry = Decimal::ZERO;
        for leg in &new_legs {
            match self.market.option_quote(leg.contract).await {
                Ok(quote) => {
                    let signed = match leg.side {
                        LegSide::Sell => quote.mid(),
                        LegSide::Buy => -quote.mid(),
                    };
                    new_entry += signed * Decimal::from(leg.ratio);
                }
                Err(e) => {
                    warn!(
                        position_id = %position.id,
                        error = %e,
                        "Replacement leg quote unavailable; roll deferred"
                    );
                    return Ok(None);
                }
            }
        }

        // The replacement structure must validate BEFORE anything is
        // submitted; a shape failure after a fill would leave the old
        // position rolled with no successor.
        let new_position = match Position::open(
            &position.symbol,
            position.strategy,
            new_legs.clone(),
            position.contracts,
            new_entry,
            derive_exit_rules(new_entry, position.contracts, &self.config.exit),
            position.delta_per_contract,
            position.beta,
        ) {
            Ok(new_position) => new_position.with_rolled_from(position.id),
            Err(e) => {
                error!(
                    position_id = %position.id,
                    error = %e,
                    "Replacement structure invalid; roll aborted, position untouched"
                );
                return Ok(None);
            }
        };

        // One order: old legs reversed to close, new legs in the original
        // orientation to open.
        let mut legs: Vec<OrderLeg> = orders::closing_legs(position);
        legs.extend(new_legs.iter().map(|leg| OrderLeg {
            contract: leg.contract,
            side: leg.side,
            ratio: leg.ratio,
        }));
        let order = ComboOrder {
            symbol: position.symbol.clone(),
            legs,
            quantity: position.contracts,
            order_type: OrderType::Market,
        };

        self.store
            .transition(guard, PositionStatus::Rolling, TransitionFields::default())?;

        let outcome = orders::submit_and_await(
            self.gateway.as_ref(),
            &order,
            Duration::from_secs(self.config.engine.fill_timeout_secs),
            Duration::from_millis(self.config.engine.order_poll_interval_ms),
        )
        .await;

        match outcome {
            Ok(report) => {
                self.store.transition(
                    guard,
                    PositionStatus::Rolled,
                    TransitionFields::exited(ExitReason::Rolled),
                )?;
                let new_id = self.store.create(new_position.clone())?;

                self.risk.remove_position(position.id);
                self.risk.add_position(&new_position);

                info!(
                    position_id = %position.id,
                    new_position_id = %new_id,
                    roll_type = %plan.roll_type,
                    entry_price = %new_entry,
                    avg_price = %report.avg_price,
                    "Roll filled; linked position opened"
                );
                Ok(Some(new_id))
            }
            Err(e @ GatewayError::OrderTimeout { .. }) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                warn!(position_id = %position.id, error = %e, "Roll not filled in time; will retry next cycle");
                Ok(None)
            }
            Err(e @ GatewayError::PartialFillMismatch { .. }) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                self.store
                    .flag_for_review(position.id, ReviewReason::PartialFillMismatch)?;
                error!(
                    position_id = %position.id,
                    error = %e,
                    "Roll fill did not match submitted legs; position frozen for manual reconciliation"
                );
                Ok(None)
            }
            Err(e) => {
                self.store
                    .transition(guard, PositionStatus::Open, TransitionFields::default())?;
                warn!(position_id = %position.id, error = %e, "Roll attempt failed; will retry next cycle");
                Ok(None)
            }
        }
    }
}
