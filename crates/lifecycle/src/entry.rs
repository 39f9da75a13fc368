//! Entry executor — turns an approved trade proposal into an open
//! position.
//!
//! Gates in order: advisory service (opaque approve + confidence
//! cutoff), portfolio risk check, contract resolution. Only then does a
//! single atomic opening order go to the gateway; the position exists in
//! the store only after a verified full fill.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use condor_core::config::AppConfig;
use condor_gateway::error::GatewayError;
use condor_gateway::traits::{AdvisoryService, MarketData, OrderGateway};
use condor_gateway::types::{ComboOrder, ContractSpec, OrderLeg, OrderType};

use crate::exit::derive_exit_rules;
use crate::position::{LegSide, LegSpec, Position, StrategyType};
use crate::risk::{PortfolioRiskManager, RiskIssue, TradeProposal};
use crate::store::PositionStore;

/// A trade proposal ready for gating and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRequest {
    pub symbol: String,
    pub strategy: StrategyType,
    pub legs: Vec<LegSpec>,
    pub contracts: u32,
    /// Notional sizing handed to the advisory service.
    pub position_size_usd: Decimal,
    /// Estimated per-contract delta of the structure, for the risk gate.
    pub delta_per_contract: Decimal,
    pub beta: Decimal,
}

impl EntryRequest {
    /// Net delta this trade would contribute to the portfolio.
    #[must_use]
    pub fn net_delta(&self) -> Decimal {
        Decimal::from(self.contracts) * self.delta_per_contract * Decimal::from(100)
    }
}

/// A structured reason an entry was declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryRejection {
    /// Advisory service said no.
    AdvisoryDeclined { confidence: u8 },
    /// Advisory approved but under the configured confidence cutoff.
    AdvisoryBelowConfidence { confidence: u8, required: u8 },
    /// Portfolio risk limit would be breached.
    Risk(RiskIssue),
    /// A leg could not be resolved to a tradable contract.
    UnresolvableLeg { spec: String },
}

impl std::fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdvisoryDeclined { confidence } => {
                write!(f, "advisory declined (confidence {confidence})")
            }
            Self::AdvisoryBelowConfidence {
                confidence,
                required,
            } => write!(
                f,
                "advisory confidence {confidence} below required {required}"
            ),
            Self::Risk(issue) => write!(f, "risk: {issue}"),
            Self::UnresolvableLeg { spec } => write!(f, "unresolvable leg: {spec}"),
        }
    }
}

/// Outcome of an entry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryOutcome {
    /// Position opened and recorded.
    Opened {
        position_id: Uuid,
        entry_price: Decimal,
    },
    /// Gated out before any order was submitted.
    Rejected { reasons: Vec<EntryRejection> },
    /// Passed the gates but the order did not fill in time.
    Unfilled,
}

/// Executes approved proposals through the gates and the gateway.
pub struct EntryExecutor<G, M, A> {
    store: Arc<PositionStore>,
    risk: Arc<PortfolioRiskManager>,
    gateway: Arc<G>,
    market: Arc<M>,
    advisory: Arc<A>,
    config: AppConfig,
}

impl<G, M, A> EntryExecutor<G, M, A>
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

    /// Runs one proposal through the gates and, if everything passes,
    /// opens the position atomically.
    pub async fn execute(&self, request: &EntryRequest) -> Result<EntryOutcome> {
        // 1. Advisory gate.
        if self.config.advisory.enabled {
            let verdict = self
                .advisory
                .propose(&request.symbol, request.position_size_usd)
                .await?;
            if !verdict.approved {
                info!(symbol = request.symbol, confidence = verdict.confidence, "Advisory declined entry");
                return Ok(EntryOutcome::Rejected {
                    reasons: vec![EntryRejection::AdvisoryDeclined {
                        confidence: verdict.confidence,
                    }],
                });
            }
            if verdict.confidence < self.config.advisory.min_confidence {
                info!(
                    symbol = request.symbol,
                    confidence = verdict.confidence,
                    required = self.config.advisory.min_confidence,
                    "Advisory confidence under cutoff"
                );
                return Ok(EntryOutcome::Rejected {
                    reasons: vec![EntryRejection::AdvisoryBelowConfidence {
                        confidence: verdict.confidence,
                        required: self.config.advisory.min_confidence,
                    }],
                });
            }
        }

        // 2. Risk gate. Never mutates the aggregate.
        let decision = self.risk.check_new_trade(&TradeProposal {
            symbol: request.symbol.clone(),
            net_delta: request.net_delta(),
            beta: request.beta,
        });
        if !decision.approved {
            return Ok(EntryOutcome::Rejected {
                reasons: decision.issues.into_iter().map(EntryRejection::Risk).collect(),
            });
        }

        // 3. Resolve every leg before building the order.
        let mut legs = Vec::with_capacity(request.legs.len());
        for spec in &request.legs {
            let contract_spec = ContractSpec::new(
                &request.symbol,
                spec.expiration,
                spec.strike,
                spec.right,
            );
            match self.gateway.resolve_contract(&contract_spec).await {
                Ok(contract) => legs.push(spec.clone().into_leg(contract)),
                Err(GatewayError::ContractResolution { spec }) => {
                    warn!(symbol = request.symbol, spec, "Entry leg unresolvable");
                    return Ok(EntryOutcome::Rejected {
                        reasons: vec![EntryRejection::UnresolvableLeg { spec }],
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Entry premium estimate from current quotes.
        let mut entry_price = Decimal::ZERO;
        for leg in &legs {
            let quote = self.market.option_quote(leg.contract).await?;
            let signed = match leg.side {
                LegSide::Sell => quote.mid(),
                LegSide::Buy => -quote.mid(),
            };
            entry_price += signed * Decimal::from(leg.ratio);
        }

        // Validate the structure before anything reaches the gateway.
        let mut position = Position::open(
            &request.symbol,
            request.strategy,
            legs.clone(),
            request.contracts,
            entry_price,
            derive_exit_rules(entry_price, request.contracts, &self.config.exit),
            request.delta_per_contract,
            request.beta,
        )?;

        // 4. One atomic opening order.
        let order = ComboOrder {
            symbol: request.symbol.clone(),
            legs: legs
                .iter()
                .map(|leg| OrderLeg {
                    contract: leg.contract,
                    side: leg.side,
                    ratio: leg.ratio,
                })
                .collect(),
            quantity: request.contracts,
            order_type: OrderType::Market,
        };

        let report = match crate::orders::submit_and_await(
            self.gateway.as_ref(),
            &order,
            Duration::from_secs(self.config.engine.fill_timeout_secs),
            Duration::from_millis(self.config.engine.order_poll_interval_ms),
        )
        .await
        {
            Ok(report) => report,
            Err(e @ GatewayError::OrderTimeout { .. }) => {
                warn!(symbol = request.symbol, error = %e, "Entry order not filled in time");
                return Ok(EntryOutcome::Unfilled);
            }
            Err(e) => return Err(e.into()),
        };

        // Prefer the gateway's fill price when it reports one.
        let fill_price = if report.avg_price.is_zero() {
            entry_price
        } else {
            report.avg_price
        };
        position.entry_price = fill_price;
        position.exit_rules = derive_exit_rules(fill_price, request.contracts, &self.config.exit);

        let position_id = self.store.create(position.clone())?;
        self.risk.add_position(&position);

        info!(
            position_id = %position_id,
            symbol = request.symbol,
            strategy = %request.strategy,
            contracts = request.contracts,
            entry_price = %fill_price,
            "Position opened"
        );
        Ok(EntryOutcome::Opened {
            position_id,
            entry_price: fill_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use condor_gateway::paper::PaperGateway;
    use condor_gateway::types::{AdvisoryVerdict, OptionRight, Quote};
    use rust_decimal_macros::dec;

    struct Fixture {
        store: Arc<PositionStore>,
        risk: Arc<PortfolioRiskManager>,
        gateway: Arc<PaperGateway>,
        executor: EntryExecutor<PaperGateway, PaperGateway, PaperGateway>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(PositionStore::new());
        let risk = Arc::new(PortfolioRiskManager::new(Default::default()));
        let gateway = Arc::new(PaperGateway::new());
        let mut config = AppConfig::default();
        config.engine.fill_timeout_secs = 0;
        config.engine.order_poll_interval_ms = 1;
        let executor = EntryExecutor::new(
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
            executor,
        }
    }

    fn put_spread_request() -> EntryRequest {
        let expiration = Utc::now().date_naive() + chrono::Duration::days(40);
        EntryRequest {
            symbol: "SPY".to_string(),
            strategy: StrategyType::VerticalCredit,
            legs: vec![
                LegSpec {
                    right: OptionRight::Put,
                    strike: dec!(550),
                    expiration,
                    side: LegSide::Sell,
                    ratio: 1,
                },
                LegSpec {
                    right: OptionRight::Put,
                    strike: dec!(545),
                    expiration,
                    side: LegSide::Buy,
                    ratio: 1,
                },
            ],
            contracts: 2,
            position_size_usd: dec!(1000),
            delta_per_contract: dec!(0.10),
            beta: dec!(1.0),
        }
    }

    fn seed_leg_quotes(fixture: &Fixture, request: &EntryRequest) {
        for (spec, mid) in request.legs.iter().zip([dec!(2.00), dec!(0.50)]) {
            let contract = fixture.gateway.register_contract(ContractSpec::new(
                &request.symbol,
                spec.expiration,
                spec.strike,
                spec.right,
            ));
            fixture.gateway.set_option_quote(
                contract,
                Quote {
                    bid: mid,
                    ask: mid,
                    last: mid,
                },
            );
        }
    }

    #[tokio::test]
    async fn approved_request_opens_position() {
        let fixture = fixture();
        let request = put_spread_request();
        seed_leg_quotes(&fixture, &request);

        let outcome = fixture.executor.execute(&request).await.unwrap();
        let EntryOutcome::Opened {
            position_id,
            entry_price,
        } = outcome
        else {
            panic!("expected Opened, got {outcome:?}");
        };

        assert_eq!(entry_price, dec!(1.50)); // 2.00 - 0.50
        let stored = fixture.store.get(position_id).unwrap();
        assert_eq!(stored.contracts, 2);
        // Derived rules: tp 0.75, stop 3.75 at the default multipliers.
        assert_eq!(stored.exit_rules.take_profit_price, dec!(0.75));
        assert_eq!(stored.exit_rules.stop_loss_price, dec!(3.75));
        assert_eq!(fixture.risk.snapshot().position_count, 1);
    }

    #[tokio::test]
    async fn advisory_decline_blocks_entry() {
        let fixture = fixture();
        fixture.gateway.set_advisory(AdvisoryVerdict {
            approved: false,
            confidence: 3,
        });
        let request = put_spread_request();

        let outcome = fixture.executor.execute(&request).await.unwrap();
        assert!(matches!(outcome, EntryOutcome::Rejected { ref reasons }
            if reasons == &vec![EntryRejection::AdvisoryDeclined { confidence: 3 }]));
        assert!(fixture.gateway.submitted_orders().is_empty());
        assert!(fixture.store.list_open().is_empty());
    }

    #[tokio::test]
    async fn low_confidence_blocks_entry() {
        let fixture = fixture();
        fixture.gateway.set_advisory(AdvisoryVerdict {
            approved: true,
            confidence: 5, // under the default cutoff of 7
        });
        let request = put_spread_request();

        let outcome = fixture.executor.execute(&request).await.unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Rejected { ref reasons }
                if matches!(reasons[0], EntryRejection::AdvisoryBelowConfidence { confidence: 5, required: 7 })
        ));
    }

    #[tokio::test]
    async fn risk_breach_blocks_entry() {
        let fixture = fixture();
        let mut request = put_spread_request();
        // 20 contracts × 0.10 × 100 = 200 net delta, over every limit.
        request.contracts = 20;

        let outcome = fixture.executor.execute(&request).await.unwrap();
        let EntryOutcome::Rejected { reasons } = outcome else {
            panic!("expected rejection");
        };
        assert!(reasons
            .iter()
            .any(|reason| matches!(reason, EntryRejection::Risk(_))));
        assert!(fixture.gateway.submitted_orders().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_leg_blocks_entry() {
        let fixture = fixture();
        fixture.gateway.set_auto_resolve(false);
        let request = put_spread_request();

        let outcome = fixture.executor.execute(&request).await.unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Rejected { ref reasons }
                if matches!(reasons[0], EntryRejection::UnresolvableLeg { .. })
        ));
        assert!(fixture.store.list_open().is_empty());
    }
}
