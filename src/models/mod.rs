//! Data models for price history, risk budgets, sizing results, and orders.

mod bar;
mod order;
mod risk;
mod sizing;

pub use bar::{PriceBar, PriceSeries};
pub use order::{round_to_tick, BracketOrder, LegRole, OrderLeg, OrderSide, OrderType, TimeInForce};
pub use risk::RiskParameters;
pub use sizing::{
    BindingConstraint, Candidate, EntryPolicy, SizingResult, StopLossPolicy, TakeProfitPolicy,
};
