//! External collaborator interfaces for the condor position engine.
//!
//! The lifecycle engine never talks to a broker, a market-data feed, or
//! the advisory service directly — it consumes the traits defined here.
//! A deterministic in-memory [`paper::PaperGateway`] implements all three
//! for tests and dry runs.

pub mod error;
pub mod paper;
pub mod traits;
pub mod types;

pub use error::{GatewayError, Result};
pub use paper::PaperGateway;
pub use traits::{AdvisoryService, MarketData, OrderGateway};
pub use types::{
    AdvisoryVerdict, BrokerHolding, ComboOrder, ContractRef, ContractSpec, FilledLeg, Greeks,
    OptionRight, OrderHandle, OrderLeg, OrderSide, OrderState, OrderStatusReport, OrderType, Quote,
};
