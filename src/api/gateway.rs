//! Broker gateway abstraction for bracket submission.
//!
//! Gateways never answer through return values beyond transport success.
//! Acknowledgements, order states, positions and errors arrive as
//! `GatewayEvent`s on the channel handed out when the gateway is created.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::models::{BracketOrder, OrderLeg, OrderSide, OrderType, SizingResult};

/// Lifecycle state of an order as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    PendingSubmit,
    /// Held by the broker (staged leg, or stop not yet triggered)
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    Inactive,
    Other(String),
}

impl OrderState {
    pub fn from_status(s: &str) -> Self {
        match s.to_lowercase().replace(['_', ' '], "").as_str() {
            "pendingsubmit" => Self::PendingSubmit,
            "presubmitted" => Self::PreSubmitted,
            "submitted" => Self::Submitted,
            "filled" => Self::Filled,
            "cancelled" | "canceled" | "apicancelled" => Self::Cancelled,
            "inactive" => Self::Inactive,
            _ => Self::Other(s.to_string()),
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(
            self,
            Self::PendingSubmit | Self::PreSubmitted | Self::Submitted
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingSubmit => write!(f, "PendingSubmit"),
            Self::PreSubmitted => write!(f, "PreSubmitted"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Filled => write!(f, "Filled"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Inactive => write!(f, "Inactive"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Report pushed by a gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// First order id the caller may use
    NextValidId(i64),
    OrderStatus {
        order_id: i64,
        status: OrderState,
        /// Broker-side id, when it differs from ours
        broker_id: Option<String>,
        filled: Decimal,
        remaining: Decimal,
    },
    OpenOrder {
        order_id: i64,
        symbol: String,
        action: OrderSide,
        order_type: OrderType,
        quantity: u64,
        price: Option<Decimal>,
        status: OrderState,
    },
    OpenOrderEnd,
    Position {
        account: String,
        symbol: String,
        quantity: Decimal,
        avg_cost: Decimal,
    },
    PositionEnd,
    Error {
        order_id: Option<i64>,
        code: i32,
        message: String,
    },
}

impl GatewayEvent {
    pub(crate) fn open_order(symbol: &str, leg: &OrderLeg, status: OrderState) -> Self {
        Self::OpenOrder {
            order_id: leg.order_id,
            symbol: symbol.to_string(),
            action: leg.action,
            order_type: leg.order_type,
            quantity: leg.quantity,
            price: leg.price(),
            status,
        }
    }

    pub(crate) fn status(order_id: i64, status: OrderState, remaining: u64) -> Self {
        Self::OrderStatus {
            order_id,
            status,
            broker_id: None,
            filled: Decimal::ZERO,
            remaining: Decimal::from(remaining),
        }
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NextValidId(id) => write!(f, "next valid id {}", id),
            Self::OrderStatus {
                order_id,
                status,
                broker_id,
                filled,
                remaining,
            } => {
                write!(
                    f,
                    "order {} {} filled={} remaining={}",
                    order_id, status, filled, remaining
                )?;
                if let Some(id) = broker_id {
                    write!(f, " broker_id={}", id)?;
                }
                Ok(())
            }
            Self::OpenOrder {
                order_id,
                symbol,
                action,
                order_type,
                quantity,
                price,
                status,
            } => write!(
                f,
                "open order {} {} {} {} {} @ {} [{}]",
                order_id,
                action,
                quantity,
                symbol,
                order_type.as_str(),
                price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                status
            ),
            Self::OpenOrderEnd => write!(f, "end of open orders"),
            Self::Position {
                account,
                symbol,
                quantity,
                avg_cost,
            } => write!(
                f,
                "position {} {} {} @ {}",
                account, symbol, quantity, avg_cost
            ),
            Self::PositionEnd => write!(f, "end of positions"),
            Self::Error {
                order_id,
                code,
                message,
            } => match order_id {
                Some(id) => write!(f, "error {} on order {}: {}", code, id, message),
                None => write!(f, "error {}: {}", code, message),
            },
        }
    }
}

/// Order entry surface of a broker connection.
#[allow(async_fn_in_trait)]
pub trait OrderGateway {
    /// Reserve `count` consecutive order ids and return the first.
    async fn reserve_order_ids(&self, count: u32) -> Result<i64>;

    async fn next_order_id(&self) -> Result<i64> {
        self.reserve_order_ids(1).await
    }

    /// Submit one leg. Legs with `transmit == false` are held until the
    /// transmitting leg of the same group arrives.
    async fn place_order(&self, symbol: &str, leg: &OrderLeg) -> Result<()>;

    /// Drop legs of `group` still held for a transmit leg, reporting each as
    /// cancelled. Returns how many were dropped.
    async fn discard_staged(&self, group: i64) -> Result<usize>;

    /// Ask for `Position` events followed by `PositionEnd`.
    async fn request_positions(&self) -> Result<()>;

    /// Ask for `OpenOrder` events followed by `OpenOrderEnd`.
    async fn request_open_orders(&self) -> Result<()>;
}

/// Monotonic order id allocator.
#[derive(Debug)]
pub struct OrderIdSequence {
    next: AtomicI64,
}

impl OrderIdSequence {
    pub fn new(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    pub fn reserve(&self, count: u32) -> i64 {
        self.next.fetch_add(i64::from(count.max(1)), Ordering::SeqCst)
    }

    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Legs waiting for their group's transmit leg, keyed by parent order id.
#[derive(Debug, Default)]
pub struct StagingBook {
    pending: HashMap<i64, Vec<OrderLeg>>,
}

impl StagingBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leg. Returns the complete group, in arrival order, once the
    /// transmitting leg is staged. Re-staging an order id replaces it.
    pub fn stage(&mut self, leg: OrderLeg) -> Option<Vec<OrderLeg>> {
        let group = leg.group_id();
        let transmit = leg.transmit;

        let legs = self.pending.entry(group).or_default();
        match legs.iter_mut().find(|l| l.order_id == leg.order_id) {
            Some(existing) => *existing = leg,
            None => legs.push(leg),
        }

        if transmit {
            self.pending.remove(&group)
        } else {
            None
        }
    }

    /// Drop a held group without transmitting it. Returns the dropped legs.
    pub fn discard(&mut self, group: i64) -> Vec<OrderLeg> {
        self.pending.remove(&group).unwrap_or_default()
    }

    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Place every leg of a bracket in order; the last leg arms the group.
///
/// If a leg fails, legs already held for the group are discarded.
pub async fn submit_bracket<G: OrderGateway>(gateway: &G, bracket: &BracketOrder) -> Result<()> {
    info!(
        symbol = %bracket.symbol,
        parent_id = bracket.parent_id(),
        quantity = bracket.parent.quantity,
        "Submitting bracket order"
    );

    for leg in bracket.legs() {
        debug!(order_id = leg.order_id, role = %leg.role, transmit = leg.transmit, "Placing leg");
        if let Err(e) = gateway.place_order(&bracket.symbol, leg).await {
            match gateway.discard_staged(bracket.parent_id()).await {
                Ok(dropped) => warn!(
                    parent_id = bracket.parent_id(),
                    dropped = dropped,
                    "Bracket aborted, held legs discarded"
                ),
                Err(discard_err) => warn!(
                    parent_id = bracket.parent_id(),
                    error = %discard_err,
                    "Failed to discard held legs"
                ),
            }
            return Err(e.context(format!("Failed to place {} leg {}", leg.role, leg.order_id)));
        }
    }

    Ok(())
}

/// Reserve ids, build the bracket for a sizing decision, and submit it.
pub async fn place_bracket<G: OrderGateway>(
    gateway: &G,
    symbol: &str,
    side: OrderSide,
    sizing: &SizingResult,
    tick: Decimal,
) -> Result<BracketOrder> {
    let parent_id = gateway.reserve_order_ids(3).await?;
    let bracket = BracketOrder::from_sizing(parent_id, symbol, side, sizing, tick)?;
    submit_bracket(gateway, &bracket).await?;
    Ok(bracket)
}

/// Collect every event already queued on the channel without waiting.
pub fn drain_events(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
