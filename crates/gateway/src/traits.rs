//! Collaborator traits consumed by the lifecycle engine.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::types::{
    AdvisoryVerdict, BrokerHolding, ComboOrder, ContractRef, ContractSpec, Greeks, OrderHandle,
    OrderStatusReport, Quote,
};

/// Brokerage order gateway.
///
/// `submit_atomic_order` carries the engine's core execution contract:
/// the full leg set fills together or not at all.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// The brokerage's authoritative holdings, keyed by contract.
    async fn portfolio_snapshot(&self) -> Result<Vec<BrokerHolding>>;

    /// Resolve a contract spec to a tradable contract reference.
    async fn resolve_contract(&self, spec: &ContractSpec) -> Result<ContractRef>;

    /// Submit an indivisible multi-leg order.
    async fn submit_atomic_order(&self, order: &ComboOrder) -> Result<OrderHandle>;

    /// Poll the current status of a submitted order.
    async fn poll_order_status(&self, handle: &OrderHandle) -> Result<OrderStatusReport>;

    /// Cancel a pending order.
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<()>;
}

/// Market data and greeks provider.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Snapshot quote for an underlying symbol.
    async fn quote(&self, symbol: &str) -> Result<Quote>;

    /// Snapshot quote for a single option contract.
    async fn option_quote(&self, contract: ContractRef) -> Result<Quote>;

    /// Greeks for a single option contract.
    async fn greeks(&self, contract: ContractRef) -> Result<Greeks>;

    /// Listed expirations for an underlying, ascending.
    async fn expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>>;
}

/// Advisory service, consumed as an opaque gate.
#[async_trait]
pub trait AdvisoryService: Send + Sync {
    /// Score a proposed new position.
    async fn propose(&self, symbol: &str, sizing: Decimal) -> Result<AdvisoryVerdict>;

    /// Model-predicted exit opinion for an open position, if any.
    ///
    /// `unrealized_pnl_pct` is signed P&L as a fraction of entry premium.
    async fn exit_signal(
        &self,
        symbol: &str,
        unrealized_pnl_pct: Decimal,
    ) -> Result<Option<AdvisoryVerdict>>;
}
