//! Contract, order, and quote types shared with the brokerage boundary.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "C"),
            Self::Put => write!(f, "P"),
        }
    }
}

/// An options contract specification, before broker resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractSpec {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub right: OptionRight,
}

impl ContractSpec {
    /// Create a new standard US equity options contract spec.
    pub fn new(symbol: &str, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            expiry,
            strike,
            right,
        }
    }

    /// Human-readable description (e.g. "NVDA 140C 2026-03-20").
    pub fn display_name(&self) -> String {
        format!("{} {}{} {}", self.symbol, self.strike, self.right, self.expiry)
    }
}

/// A broker-resolved contract identifier.
///
/// Opaque to the engine; only the brokerage can mint one, via
/// [`crate::traits::OrderGateway::resolve_contract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractRef(pub i64);

impl std::fmt::Display for ContractRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of a single leg within a combo order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The opposite side, used when closing an existing leg.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// One leg of a multi-leg (combo) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub contract: ContractRef,
    pub side: OrderSide,
    pub ratio: u32,
}

/// Order pricing instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
}

/// An indivisible multi-leg order.
///
/// The gateway must fill the complete leg set or none of it; the engine
/// never decomposes a combo into sequential single-leg orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComboOrder {
    pub symbol: String,
    pub legs: Vec<OrderLeg>,
    /// Quantity multiplier applied uniformly to all legs.
    pub quantity: u32,
    pub order_type: OrderType,
}

impl ComboOrder {
    /// Expected fill quantity for a given leg.
    #[must_use]
    pub fn expected_quantity(&self, leg: &OrderLeg) -> u32 {
        self.quantity * leg.ratio
    }
}

/// Handle for a submitted order, used to poll and cancel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderHandle(pub String);

impl std::fmt::Display for OrderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gateway-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Submitted,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// Returns true once the gateway will report no further changes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// A single filled leg within an order status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilledLeg {
    pub contract: ContractRef,
    pub side: OrderSide,
    pub quantity: u32,
}

/// Snapshot of an order's progress at the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub handle: OrderHandle,
    pub state: OrderState,
    pub filled_legs: Vec<FilledLeg>,
    /// Average net price per combo unit (credit positive for the engine's
    /// sign convention is applied by the caller).
    pub avg_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// One line of the brokerage's authoritative portfolio snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHolding {
    pub contract: ContractRef,
    /// Signed quantity: positive long, negative short.
    pub quantity: i64,
}

/// Market quote for an underlying or a single contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
}

impl Quote {
    /// Midpoint of bid/ask.
    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::from(2)
    }
}

/// Greeks snapshot for a single contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: Decimal,
    pub gamma: Decimal,
    pub theta: Decimal,
    pub vega: Decimal,
    pub vanna: Decimal,
}

/// Advisory service verdict on a proposed trade or exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryVerdict {
    pub approved: bool,
    /// Confidence score, 1..=10.
    pub confidence: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_side_reversed() {
        assert_eq!(OrderSide::Buy.reversed(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.reversed(), OrderSide::Buy);
    }

    #[test]
    fn quote_mid() {
        let quote = Quote {
            bid: dec!(1.00),
            ask: dec!(1.10),
            last: dec!(1.02),
        };
        assert_eq!(quote.mid(), dec!(1.05));
    }

    #[test]
    fn combo_expected_quantity_scales_by_ratio() {
        let leg = OrderLeg {
            contract: ContractRef(1),
            side: OrderSide::Sell,
            ratio: 2,
        };
        let order = ComboOrder {
            symbol: "SPY".to_string(),
            legs: vec![leg.clone()],
            quantity: 3,
            order_type: OrderType::Market,
        };
        assert_eq!(order.expected_quantity(&leg), 6);
    }

    #[test]
    fn contract_spec_display_name() {
        let spec = ContractSpec::new(
            "nvda",
            NaiveDate::from_ymd_opt(2026, 3, 20).unwrap(),
            dec!(140),
            OptionRight::Call,
        );
        assert_eq!(spec.symbol, "NVDA");
        assert_eq!(spec.display_name(), "NVDA 140C 2026-03-20");
    }

    #[test]
    fn order_state_terminal() {
        assert!(OrderState::Filled.is_terminal());
        assert!(OrderState::Cancelled.is_terminal());
        assert!(OrderState::Rejected.is_terminal());
        assert!(!OrderState::Submitted.is_terminal());
    }
}
