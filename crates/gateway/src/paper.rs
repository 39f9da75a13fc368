//! Deterministic in-memory gateway for tests and dry runs.
//!
//! Simulates the brokerage boundary without any network I/O. Fill
//! behavior is scripted per test: immediate full fills, orders that hang
//! (to drive the bounded-wait timeout path), rejections, and fills that
//! violate the atomic leg-set contract (to exercise the partial-fill
//! mismatch handling).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::traits::{AdvisoryService, MarketData, OrderGateway};
use crate::types::{
    AdvisoryVerdict, BrokerHolding, ComboOrder, ContractRef, ContractSpec, FilledLeg, Greeks,
    OrderHandle, OrderState, OrderStatusReport, Quote,
};

/// How the paper gateway responds to submitted orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Fill every leg immediately.
    #[default]
    Fill,
    /// Leave the order sitting in `Submitted` until cancelled.
    Hold,
    /// Reject the order outright.
    Reject,
    /// Report a fill that is missing the last leg — violates the atomic
    /// contract and must surface as a partial-fill mismatch upstream.
    DropLastLeg,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    order: ComboOrder,
    state: OrderState,
}

struct PaperState {
    next_contract_id: i64,
    next_order_id: u64,
    contracts: HashMap<ContractSpec, ContractRef>,
    auto_resolve: bool,
    holdings: Vec<BrokerHolding>,
    quotes: HashMap<String, Quote>,
    option_quotes: HashMap<ContractRef, Quote>,
    greeks: HashMap<ContractRef, Greeks>,
    expirations: HashMap<String, Vec<NaiveDate>>,
    orders: HashMap<OrderHandle, PaperOrder>,
    fill_mode: FillMode,
    fill_price: Decimal,
    advisory: AdvisoryVerdict,
    advisory_exit: Option<AdvisoryVerdict>,
    offline: bool,
}

impl Default for PaperState {
    fn default() -> Self {
        Self {
            next_contract_id: 1000,
            next_order_id: 0,
            contracts: HashMap::new(),
            auto_resolve: true,
            holdings: Vec::new(),
            quotes: HashMap::new(),
            option_quotes: HashMap::new(),
            greeks: HashMap::new(),
            expirations: HashMap::new(),
            orders: HashMap::new(),
            fill_mode: FillMode::Fill,
            fill_price: Decimal::ZERO,
            advisory: AdvisoryVerdict {
                approved: true,
                confidence: 8,
            },
            advisory_exit: None,
            offline: false,
        }
    }
}

/// In-memory implementation of all three collaborator traits.
pub struct PaperGateway {
    state: RwLock<PaperState>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PaperState::default()),
        }
    }

    /// Pre-register a contract spec with a fixed reference.
    pub fn register_contract(&self, spec: ContractSpec) -> ContractRef {
        let mut state = self.state.write();
        state.next_contract_id += 1;
        let contract = ContractRef(state.next_contract_id);
        state.contracts.insert(spec, contract);
        contract
    }

    /// When disabled, only pre-registered specs resolve; everything else
    /// fails with a resolution error.
    pub fn set_auto_resolve(&self, auto_resolve: bool) {
        self.state.write().auto_resolve = auto_resolve;
    }

    /// Replace the brokerage holdings snapshot.
    pub fn set_holdings(&self, holdings: Vec<BrokerHolding>) {
        self.state.write().holdings = holdings;
    }

    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.state.write().quotes.insert(symbol.to_uppercase(), quote);
    }

    pub fn set_option_quote(&self, contract: ContractRef, quote: Quote) {
        self.state.write().option_quotes.insert(contract, quote);
    }

    pub fn set_greeks(&self, contract: ContractRef, greeks: Greeks) {
        self.state.write().greeks.insert(contract, greeks);
    }

    pub fn set_expirations(&self, symbol: &str, expirations: Vec<NaiveDate>) {
        self.state
            .write()
            .expirations
            .insert(symbol.to_uppercase(), expirations);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state.write().fill_mode = mode;
    }

    /// Average fill price reported on filled orders.
    pub fn set_fill_price(&self, price: Decimal) {
        self.state.write().fill_price = price;
    }

    pub fn set_advisory(&self, verdict: AdvisoryVerdict) {
        self.state.write().advisory = verdict;
    }

    pub fn set_exit_signal(&self, verdict: Option<AdvisoryVerdict>) {
        self.state.write().advisory_exit = verdict;
    }

    /// Simulates a broker connectivity outage: every gateway call fails
    /// with a transient connectivity error until restored.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    fn check_online(&self) -> Result<()> {
        if self.state.read().offline {
            return Err(GatewayError::Connectivity(
                "paper gateway offline".to_string(),
            ));
        }
        Ok(())
    }

    /// All orders submitted so far, oldest first.
    pub fn submitted_orders(&self) -> Vec<ComboOrder> {
        let state = self.state.read();
        let mut orders: Vec<_> = state.orders.iter().collect();
        orders.sort_by(|a, b| a.0 .0.cmp(&b.0 .0));
        orders.into_iter().map(|(_, o)| o.order.clone()).collect()
    }

    /// Current state of a submitted order.
    pub fn order_state(&self, handle: &OrderHandle) -> Option<OrderState> {
        self.state.read().orders.get(handle).map(|o| o.state)
    }

    fn filled_legs_for(order: &ComboOrder, mode: FillMode) -> Vec<FilledLeg> {
        let mut legs: Vec<FilledLeg> = order
            .legs
            .iter()
            .map(|leg| FilledLeg {
                contract: leg.contract,
                side: leg.side,
                quantity: order.expected_quantity(leg),
            })
            .collect();
        if mode == FillMode::DropLastLeg {
            legs.pop();
        }
        legs
    }

    fn apply_fill_to_holdings(state: &mut PaperState, legs: &[FilledLeg]) {
        for leg in legs {
            let signed = match leg.side {
                crate::types::OrderSide::Buy => leg.quantity as i64,
                crate::types::OrderSide::Sell => -(leg.quantity as i64),
            };
            if let Some(holding) = state
                .holdings
                .iter_mut()
                .find(|h| h.contract == leg.contract)
            {
                holding.quantity += signed;
            } else {
                state.holdings.push(BrokerHolding {
                    contract: leg.contract,
                    quantity: signed,
                });
            }
        }
        state.holdings.retain(|h| h.quantity != 0);
    }
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn portfolio_snapshot(&self) -> Result<Vec<BrokerHolding>> {
        self.check_online()?;
        Ok(self.state.read().holdings.clone())
    }

    async fn resolve_contract(&self, spec: &ContractSpec) -> Result<ContractRef> {
        self.check_online()?;
        let mut state = self.state.write();
        if let Some(contract) = state.contracts.get(spec) {
            return Ok(*contract);
        }
        if !state.auto_resolve {
            return Err(GatewayError::contract_resolution(spec.display_name()));
        }
        state.next_contract_id += 1;
        let contract = ContractRef(state.next_contract_id);
        state.contracts.insert(spec.clone(), contract);
        debug!(spec = %spec.display_name(), %contract, "Paper contract resolved");
        Ok(contract)
    }

    async fn submit_atomic_order(&self, order: &ComboOrder) -> Result<OrderHandle> {
        self.check_online()?;
        let mut state = self.state.write();
        if state.fill_mode == FillMode::Reject {
            return Err(GatewayError::OrderRejected(
                "paper gateway configured to reject".to_string(),
            ));
        }

        state.next_order_id += 1;
        let handle = OrderHandle(format!("PAPER-{:06}", state.next_order_id));

        let order_state = match state.fill_mode {
            FillMode::Fill | FillMode::DropLastLeg => OrderState::Filled,
            FillMode::Hold => OrderState::Submitted,
            FillMode::Reject => unreachable!(),
        };

        if order_state == OrderState::Filled {
            let legs = Self::filled_legs_for(order, state.fill_mode);
            Self::apply_fill_to_holdings(&mut state, &legs);
        }

        state.orders.insert(
            handle.clone(),
            PaperOrder {
                order: order.clone(),
                state: order_state,
            },
        );

        info!(
            %handle,
            symbol = order.symbol,
            legs = order.legs.len(),
            quantity = order.quantity,
            "Paper order submitted"
        );
        Ok(handle)
    }

    async fn poll_order_status(&self, handle: &OrderHandle) -> Result<OrderStatusReport> {
        self.check_online()?;
        let state = self.state.read();
        let paper = state
            .orders
            .get(handle)
            .ok_or_else(|| GatewayError::OrderNotFound {
                handle: handle.clone(),
            })?;

        let filled_legs = if paper.state == OrderState::Filled {
            Self::filled_legs_for(&paper.order, state.fill_mode)
        } else {
            Vec::new()
        };

        Ok(OrderStatusReport {
            handle: handle.clone(),
            state: paper.state,
            filled_legs,
            avg_price: state.fill_price,
            updated_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> Result<()> {
        let mut state = self.state.write();
        let paper = state
            .orders
            .get_mut(handle)
            .ok_or_else(|| GatewayError::OrderNotFound {
                handle: handle.clone(),
            })?;
        if !paper.state.is_terminal() {
            paper.state = OrderState::Cancelled;
        }
        Ok(())
    }
}

#[async_trait]
impl MarketData for PaperGateway {
    async fn quote(&self, symbol: &str) -> Result<Quote> {
        self.state
            .read()
            .quotes
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| GatewayError::MarketData(format!("no quote for {symbol}")))
    }

    async fn option_quote(&self, contract: ContractRef) -> Result<Quote> {
        self.state
            .read()
            .option_quotes
            .get(&contract)
            .copied()
            .ok_or_else(|| GatewayError::MarketData(format!("no quote for contract {contract}")))
    }

    async fn greeks(&self, contract: ContractRef) -> Result<Greeks> {
        self.state
            .read()
            .greeks
            .get(&contract)
            .copied()
            .ok_or_else(|| GatewayError::MarketData(format!("no greeks for contract {contract}")))
    }

    async fn expirations(&self, symbol: &str) -> Result<Vec<NaiveDate>> {
        self.state
            .read()
            .expirations
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| GatewayError::MarketData(format!("no expirations for {symbol}")))
    }
}

#[async_trait]
impl AdvisoryService for PaperGateway {
    async fn propose(&self, _symbol: &str, _sizing: Decimal) -> Result<AdvisoryVerdict> {
        Ok(self.state.read().advisory)
    }

    async fn exit_signal(
        &self,
        _symbol: &str,
        _unrealized_pnl_pct: Decimal,
    ) -> Result<Option<AdvisoryVerdict>> {
        Ok(self.state.read().advisory_exit)
    }
}
