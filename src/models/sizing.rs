//! Sizing outputs: tagged price candidates and the final sizing decision.

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// How an entry price candidate was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum EntryPolicy {
    /// Stop-buy just above the most recent high
    BreakoutHigh,
    /// Most recent close plus the entry premium
    LastClose,
    /// Mean close over a trailing window
    AverageClose { window: usize },
}

impl fmt::Display for EntryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BreakoutHigh => write!(f, "Breakout high"),
            Self::LastClose => write!(f, "Last close"),
            Self::AverageClose { window } => write!(f, "Avg close ({}d)", window),
        }
    }
}

/// How a stop-loss candidate was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum StopLossPolicy {
    /// Entry minus a multiple of the average true range
    Atr { multiplier: Decimal, period: usize },
    /// Lowest low over a trailing window
    LowestLow { window: usize },
    /// Fixed fraction below entry
    Percentage { pct: Decimal },
    /// Simple moving average of closes
    Sma { period: usize },
}

impl fmt::Display for StopLossPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atr { multiplier, period } => write!(f, "{}x ATR({})", multiplier, period),
            Self::LowestLow { window } => write!(f, "Lowest low ({}d)", window),
            Self::Percentage { pct } => write!(f, "-{}%", (pct * dec!(100)).normalize()),
            Self::Sma { period } => write!(f, "SMA({})", period),
        }
    }
}

/// How a take-profit candidate was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum TakeProfitPolicy {
    /// Entry plus `ratio` times the risk per share
    RewardRisk { ratio: Decimal },
    /// Fixed fraction above entry
    Percentage { pct: Decimal },
}

impl fmt::Display for TakeProfitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RewardRisk { ratio } => write!(f, "{}:1 reward/risk", ratio),
            Self::Percentage { pct } => write!(f, "+{}%", (pct * dec!(100)).normalize()),
        }
    }
}

/// One candidate price produced by a sizing step, tagged with its policy.
///
/// Invalid candidates stay in the set so the caller can show why they were
/// rejected, but they must not be selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate<P> {
    pub policy: P,
    pub price: Decimal,
    pub invalid_reason: Option<String>,
}

impl<P> Candidate<P> {
    pub fn valid(policy: P, price: Decimal) -> Self {
        Self {
            policy,
            price,
            invalid_reason: None,
        }
    }

    pub fn invalid(policy: P, price: Decimal, reason: impl Into<String>) -> Self {
        Self {
            policy,
            price,
            invalid_reason: Some(reason.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

/// Which cap limited the share count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingConstraint {
    /// Dollar risk budget bound first
    Risk,
    /// Capital allocation per position bound first
    Capital,
}

impl fmt::Display for BindingConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Risk => write!(f, "risk budget"),
            Self::Capital => write!(f, "capital allocation"),
        }
    }
}

/// Final sizing decision for a long position. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizingResult {
    pub entry_price: Decimal,
    pub stop_loss_price: Decimal,
    pub take_profit_price: Decimal,
    pub share_count: u64,

    /// Shares allowed by the risk budget alone
    pub risk_cap_shares: Decimal,
    /// Shares allowed by the capital allocation alone
    pub capital_cap_shares: Decimal,
    pub binding: BindingConstraint,
}

impl SizingResult {
    /// Loss per share if the stop is hit.
    pub fn risk_per_share(&self) -> Decimal {
        self.entry_price - self.stop_loss_price
    }

    /// Total loss if the stop is hit.
    pub fn risk_dollars(&self) -> Decimal {
        Decimal::from(self.share_count) * self.risk_per_share()
    }

    /// Capital committed at entry.
    pub fn position_value(&self) -> Decimal {
        Decimal::from(self.share_count) * self.entry_price
    }

    /// Distance from entry to stop, percent of entry.
    pub fn stop_loss_pct(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        self.risk_per_share() / self.entry_price * dec!(100)
    }

    /// Distance from entry to target, percent of entry.
    pub fn take_profit_pct(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.take_profit_price - self.entry_price) / self.entry_price * dec!(100)
    }
}
