//! Atomic combo-order submission and bounded fill waiting.
//!
//! Shared by the exit monitor and the roll manager. A submitted order is
//! polled until it reaches a terminal state or the bounded wait elapses;
//! a fill that does not exactly match the submitted leg set is a
//! partial-fill mismatch, never a success.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use condor_gateway::error::GatewayError;
use condor_gateway::traits::OrderGateway;
use condor_gateway::types::{
    ComboOrder, OrderLeg, OrderState, OrderStatusReport, OrderType,
};

use crate::position::Position;

/// Legs that close an existing position: every leg reversed.
pub(crate) fn closing_legs(position: &Position) -> Vec<OrderLeg> {
    position
        .legs
        .iter()
        .map(|leg| OrderLeg {
            contract: leg.contract,
            side: leg.side.reversed(),
            ratio: leg.ratio,
        })
        .collect()
}

/// A single atomic order closing all of a position's legs at market.
pub(crate) fn closing_order(position: &Position) -> ComboOrder {
    ComboOrder {
        symbol: position.symbol.clone(),
        legs: closing_legs(position),
        quantity: position.contracts,
        order_type: OrderType::Market,
    }
}

/// Checks that a reported fill covers exactly the submitted leg set.
pub(crate) fn verify_fill(
    order: &ComboOrder,
    report: &OrderStatusReport,
) -> Result<(), GatewayError> {
    let matched = order
        .legs
        .iter()
        .filter(|leg| {
            report.filled_legs.iter().any(|filled| {
                filled.contract == leg.contract
                    && filled.side == leg.side
                    && filled.quantity == order.expected_quantity(leg)
            })
        })
        .count();

    if matched != order.legs.len() || report.filled_legs.len() != order.legs.len() {
        return Err(GatewayError::partial_fill_mismatch(
            report.handle.clone(),
            order.legs.len(),
            matched,
        ));
    }
    Ok(())
}

/// Submits an atomic order and waits for a verified full fill.
///
/// On timeout the order is cancelled and `OrderTimeout` returned — the
/// caller leaves position state unchanged and retries next cycle. A fill
/// that fails [`verify_fill`] propagates as `PartialFillMismatch`.
pub(crate) async fn submit_and_await<G: OrderGateway>(
    gateway: &G,
    order: &ComboOrder,
    fill_timeout: Duration,
    poll_interval: Duration,
) -> Result<OrderStatusReport, GatewayError> {
    let handle = gateway.submit_atomic_order(order).await?;
    let started = Instant::now();

    loop {
        let report = gateway.poll_order_status(&handle).await?;
        match report.state {
            OrderState::Filled => {
                verify_fill(order, &report)?;
                debug!(%handle, avg_price = %report.avg_price, "Atomic order filled");
                return Ok(report);
            }
            OrderState::Rejected => {
                return Err(GatewayError::OrderRejected(format!(
                    "order {handle} rejected by gateway"
                )));
            }
            OrderState::Cancelled => {
                return Err(GatewayError::order_timeout(
                    handle,
                    started.elapsed().as_secs(),
                ));
            }
            OrderState::Submitted => {}
        }

        if started.elapsed() >= fill_timeout {
            warn!(%handle, waited_secs = started.elapsed().as_secs(), "Fill wait elapsed, cancelling");
            gateway.cancel_order(&handle).await?;
            return Err(GatewayError::order_timeout(
                handle,
                started.elapsed().as_secs(),
            ));
        }
        sleep(poll_interval).await;
    }
}
