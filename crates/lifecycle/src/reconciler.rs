//! Startup reconciliation — corrects internal position state against the
//! brokerage's authoritative holdings.
//!
//! Runs to completion before any monitor is allowed to act, so the
//! monitors never operate on stale or ghost positions. A position whose
//! legs are all present is matched; one with no legs present was closed
//! externally; one with a strict subset present is flagged inconsistent
//! and excluded from automatic action, because auto-closing or rolling a
//! partially matched position would act on wrong assumptions about real
//! exposure. Broker holdings with no internal owner are reported but
//! never auto-adopted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use condor_gateway::error::Result;
use condor_gateway::traits::OrderGateway;
use condor_gateway::types::{BrokerHolding, ContractRef};

use crate::position::{ExitReason, LegSide, Position, PositionStatus, ReviewReason};
use crate::risk::PortfolioRiskManager;
use crate::store::{PositionStore, TransitionFields};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    /// Positions whose full leg set is present at the broker.
    pub matched: Vec<Uuid>,
    /// Positions with no legs at the broker, transitioned to
    /// `ClosedExternally`.
    pub closed_externally: Vec<Uuid>,
    /// Positions with a strict subset of legs present, held for review.
    pub inconsistent: Vec<Uuid>,
    /// Broker holdings with no corresponding internal position.
    pub untracked: Vec<ContractRef>,
}

impl ReconciliationReport {
    /// True when every internal position matched and nothing untracked
    /// was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.closed_externally.is_empty()
            && self.inconsistent.is_empty()
            && self.untracked.is_empty()
    }
}

/// Diffs the position store against the brokerage portfolio.
pub struct Reconciler<G> {
    store: Arc<PositionStore>,
    risk: Arc<PortfolioRiskManager>,
    gateway: Arc<G>,
    /// Log of completed passes, oldest first.
    reports: RwLock<Vec<ReconciliationReport>>,
}

/// How one position's leg set compares to the broker snapshot.
enum LegPresence {
    All,
    None,
    Subset,
}

impl<G: OrderGateway> Reconciler<G> {
    pub fn new(
        store: Arc<PositionStore>,
        risk: Arc<PortfolioRiskManager>,
        gateway: Arc<G>,
    ) -> Self {
        Self {
            store,
            risk,
            gateway,
            reports: RwLock::new(Vec::new()),
        }
    }

    /// Runs one reconciliation pass.
    ///
    /// A connectivity failure propagates to the caller — at startup the
    /// service fails closed rather than letting monitors act on an
    /// unverified book.
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let holdings = self.gateway.portfolio_snapshot().await?;
        let by_contract: HashMap<ContractRef, i64> = holdings
            .iter()
            .map(|holding| (holding.contract, holding.quantity))
            .collect();

        let open = self.store.list_open();
        info!(
            internal = open.len(),
            broker = holdings.len(),
            "Reconciling positions against broker portfolio"
        );

        let mut report = ReconciliationReport {
            timestamp: Utc::now(),
            matched: Vec::new(),
            closed_externally: Vec::new(),
            inconsistent: Vec::new(),
            untracked: Vec::new(),
        };

        for position in &open {
            match Self::leg_presence(position, &by_contract) {
                LegPresence::All => {
                    debug!(position_id = %position.id, symbol = position.symbol, "Position matched");
                    report.matched.push(position.id);
                }
                LegPresence::None => {
                    self.mark_closed_externally(position, &mut report);
                }
                LegPresence::Subset => {
                    warn!(
                        position_id = %position.id,
                        symbol = position.symbol,
                        "Partial leg match at broker; holding for manual review"
                    );
                    if let Err(e) = self
                        .store
                        .flag_for_review(position.id, ReviewReason::ReconciliationMismatch)
                    {
                        warn!(position_id = %position.id, error = %e, "Failed to flag position");
                    }
                    report.inconsistent.push(position.id);
                }
            }
        }

        // Broker holdings no open position accounts for. Reported only;
        // manual entries are never auto-adopted.
        let tracked: std::collections::HashSet<ContractRef> = open
            .iter()
            .flat_map(|position| position.legs.iter().map(|leg| leg.contract))
            .collect();
        for holding in &holdings {
            if !tracked.contains(&holding.contract) {
                warn!(
                    contract = %holding.contract,
                    quantity = holding.quantity,
                    "Untracked broker holding (manual entry?)"
                );
                report.untracked.push(holding.contract);
            }
        }

        info!(
            matched = report.matched.len(),
            closed_externally = report.closed_externally.len(),
            inconsistent = report.inconsistent.len(),
            untracked = report.untracked.len(),
            "Reconciliation complete"
        );
        self.reports.write().push(report.clone());
        Ok(report)
    }

    fn mark_closed_externally(&self, position: &Position, report: &mut ReconciliationReport) {
        // Only quiescent positions auto-close; anything mid-operation is
        // left for its operator (or the next pass).
        if position.status != PositionStatus::Open {
            warn!(
                position_id = %position.id,
                status = %position.status,
                "Position absent at broker but mid-operation; deferring"
            );
            return;
        }
        let Some(guard) = self.store.try_begin_operation(position.id) else {
            warn!(position_id = %position.id, "Position locked; deferring external-close");
            return;
        };
        warn!(
            position_id = %position.id,
            symbol = position.symbol,
            "No legs at broker; marking closed externally"
        );
        match self.store.transition(
            &guard,
            PositionStatus::ClosedExternally,
            TransitionFields::exited(ExitReason::ExternalClose),
        ) {
            Ok(_) => {
                self.risk.remove_position(position.id);
                report.closed_externally.push(position.id);
            }
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "External-close transition failed");
            }
        }
    }

    /// Compares a position's expected leg quantities against the broker
    /// snapshot. A leg is present when the signed holding covers at
    /// least `contracts × ratio` in the leg's direction.
    fn leg_presence(position: &Position, by_contract: &HashMap<ContractRef, i64>) -> LegPresence {
        let mut present = 0usize;
        for leg in &position.legs {
            let required = i64::from(position.contracts) * i64::from(leg.ratio);
            let held = by_contract.get(&leg.contract).copied().unwrap_or(0);
            let covered = match leg.side {
                LegSide::Buy => held >= required,
                LegSide::Sell => held <= -required,
            };
            if covered {
                present += 1;
            }
        }
        if present == position.legs.len() {
            LegPresence::All
        } else if present == 0 {
            LegPresence::None
        } else {
            LegPresence::Subset
        }
    }

    /// All completed reports, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<ReconciliationReport> {
        self.reports.read().clone()
    }

    /// The most recent report, if any pass has completed.
    #[must_use]
    pub fn last_report(&self) -> Option<ReconciliationReport> {
        self.reports.read().last().cloned()
    }
}
