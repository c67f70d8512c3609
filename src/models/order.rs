//! Bracket order model: a parent entry plus an OCO take-profit/stop-loss pair.

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::trading::SizingError;

use super::SizingResult;

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Side that closes a position opened on this side.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type as understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Stop order, triggers at the aux price
    #[serde(rename = "STP")]
    Stop,
    /// Limit order
    #[serde(rename = "LMT")]
    Limit,
    /// Market order
    #[serde(rename = "MKT")]
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Stop => "STP",
            OrderType::Limit => "LMT",
            OrderType::Market => "MKT",
        }
    }

    /// Parse a gateway order type code or its long name.
    pub fn from_code(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STP" | "STOP" => Some(Self::Stop),
            "LMT" | "LIMIT" => Some(Self::Limit),
            "MKT" | "MARKET" => Some(Self::Market),
            _ => None,
        }
    }
}

/// How long an order stays working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Day,
    Gtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "DAY",
            TimeInForce::Gtc => "GTC",
        }
    }
}

/// Position of a leg within its bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegRole {
    Parent,
    TakeProfit,
    StopLoss,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Parent => write!(f, "parent"),
            LegRole::TakeProfit => write!(f, "take_profit"),
            LegRole::StopLoss => write!(f, "stop_loss"),
        }
    }
}

/// A single order within a bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub order_id: i64,
    /// Parent order this leg is attached to (children only)
    pub parent_id: Option<i64>,
    pub role: LegRole,
    pub action: OrderSide,
    pub order_type: OrderType,
    pub quantity: u64,
    /// Limit price (LMT legs)
    pub limit_price: Option<Decimal>,
    /// Trigger price (STP legs)
    pub aux_price: Option<Decimal>,
    /// One-cancels-other group shared by the child legs
    pub oca_group: Option<String>,
    pub tif: TimeInForce,
    /// Only the final leg transmits; earlier legs are held until it arrives
    pub transmit: bool,
}

impl OrderLeg {
    /// Price the leg works at, whichever field carries it.
    pub fn price(&self) -> Option<Decimal> {
        self.limit_price.or(self.aux_price)
    }

    /// Id of the bracket this leg belongs to.
    pub fn group_id(&self) -> i64 {
        self.parent_id.unwrap_or(self.order_id)
    }
}

/// Three-leg bracket: entry, take-profit, stop-loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BracketOrder {
    pub symbol: String,
    pub parent: OrderLeg,
    pub take_profit: OrderLeg,
    pub stop_loss: OrderLeg,
}

impl BracketOrder {
    /// Build a bracket from a sizing decision.
    ///
    /// The parent is a stop order at the entry price so it only fills once
    /// price trades through the breakout level. Child ids follow the parent
    /// id; prices are rounded to `tick`.
    pub fn from_sizing(
        parent_id: i64,
        symbol: &str,
        side: OrderSide,
        sizing: &SizingResult,
        tick: Decimal,
    ) -> Result<Self, SizingError> {
        if sizing.share_count == 0 {
            return Err(SizingError::InvalidParameter(
                "share count is zero, nothing to submit".to_string(),
            ));
        }
        if tick <= Decimal::ZERO {
            return Err(SizingError::InvalidParameter(format!(
                "price tick must be positive, got {}",
                tick
            )));
        }

        let entry = round_to_tick(sizing.entry_price, tick);
        let take_profit = round_to_tick(sizing.take_profit_price, tick);
        let stop_loss = round_to_tick(sizing.stop_loss_price, tick);

        let ordered = match side {
            OrderSide::Buy => stop_loss < entry && entry < take_profit,
            OrderSide::Sell => take_profit < entry && entry < stop_loss,
        };
        if !ordered {
            return Err(SizingError::InvalidRisk(format!(
                "{} bracket needs stop {} / entry {} / target {} on the correct sides",
                side, stop_loss, entry, take_profit
            )));
        }

        let quantity = sizing.share_count;
        let exit_side = side.opposite();
        let oca_group = format!("OCA_{}", parent_id);

        let parent = OrderLeg {
            order_id: parent_id,
            parent_id: None,
            role: LegRole::Parent,
            action: side,
            order_type: OrderType::Stop,
            quantity,
            limit_price: None,
            aux_price: Some(entry),
            oca_group: None,
            tif: TimeInForce::Gtc,
            transmit: false,
        };

        let take_profit = OrderLeg {
            order_id: parent_id + 1,
            parent_id: Some(parent_id),
            role: LegRole::TakeProfit,
            action: exit_side,
            order_type: OrderType::Limit,
            quantity,
            limit_price: Some(take_profit),
            aux_price: None,
            oca_group: Some(oca_group.clone()),
            tif: TimeInForce::Gtc,
            transmit: false,
        };

        let stop_loss = OrderLeg {
            order_id: parent_id + 2,
            parent_id: Some(parent_id),
            role: LegRole::StopLoss,
            action: exit_side,
            order_type: OrderType::Stop,
            quantity,
            limit_price: None,
            aux_price: Some(stop_loss),
            oca_group: Some(oca_group),
            tif: TimeInForce::Gtc,
            transmit: true,
        };

        Ok(Self {
            symbol: symbol.to_uppercase(),
            parent,
            take_profit,
            stop_loss,
        })
    }

    /// Legs in submission order. The last one transmits the group.
    pub fn legs(&self) -> [&OrderLeg; 3] {
        [&self.parent, &self.take_profit, &self.stop_loss]
    }

    pub fn parent_id(&self) -> i64 {
        self.parent.order_id
    }
}

/// Round a price to the nearest tick, half away from zero.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    let ticks = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (ticks * tick).normalize()
}
