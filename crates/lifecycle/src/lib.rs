//! Position lifecycle and portfolio risk engine.
//!
//! Owns multi-leg options position state and drives it through its
//! lifecycle:
//! - The [`store::PositionStore`] is the single writer-of-record, with a
//!   per-position exclusive-operation guard.
//! - The [`risk::PortfolioRiskManager`] keeps a derived net / beta-weighted
//!   delta aggregate and gates new trades.
//! - The [`exit::ExitMonitor`] and [`roll::RollManager`] run as periodic
//!   tasks, submitting atomic multi-leg orders through the gateway.
//! - The [`reconciler::Reconciler`] diffs the store against the
//!   brokerage's real portfolio at startup, before any monitor acts.
//!
//! All rules in the execution path are deterministic; the advisory
//! service is consumed only as an opaque gate.

pub mod entry;
pub mod exit;
mod orders;
pub mod position;
pub mod reconciler;
pub mod risk;
pub mod roll;
pub mod service;
pub mod store;

pub use entry::{EntryExecutor, EntryOutcome, EntryRejection, EntryRequest};
pub use exit::ExitMonitor;
pub use position::{
    ExitReason, ExitRules, Leg, LegSide, LegSpec, Position, PositionError, PositionStatus,
    ReviewReason, StrategyType,
};
pub use reconciler::{ReconciliationReport, Reconciler};
pub use risk::{PortfolioRiskManager, RiskDecision, RiskIssue, RiskSnapshot, TradeProposal};
pub use roll::{RollManager, RollPlan, RollTrigger, RollType};
pub use service::LifecycleEngine;
pub use store::{OperationGuard, PositionStore, StoreError, TransitionFields};
