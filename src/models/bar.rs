//! Daily price bars and the immutable series built from them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::SizingError;

/// One trading session's price range.
///
/// Only `high >= low` is guaranteed. Upstream data can put the close outside
/// the high/low range, so nothing here assumes `high >= close >= low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBar {
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,

    /// Session open time, display only
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PriceBar {
    /// Create a bar, rejecting an inverted high/low range.
    pub fn new(high: Decimal, low: Decimal, close: Decimal) -> Result<Self, SizingError> {
        if high < low {
            return Err(SizingError::InvalidParameter(format!(
                "bar high {} is below low {}",
                high, low
            )));
        }

        Ok(Self {
            high,
            low,
            close,
            timestamp: None,
        })
    }

    /// Attach the session timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Intraday range, ignoring gaps against the prior close.
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Chronologically ordered, non-empty sequence of bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceSeries {
    symbol: String,
    bars: Vec<PriceBar>,
}

impl PriceSeries {
    /// Build a series. Fails with `InsufficientData` if `bars` is empty.
    pub fn new(symbol: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self, SizingError> {
        if bars.is_empty() {
            return Err(SizingError::InsufficientData {
                needed: 1,
                available: 0,
            });
        }

        Ok(Self {
            symbol: symbol.into(),
            bars,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Most recent bar. Always present.
    pub fn last(&self) -> &PriceBar {
        // Non-empty by construction
        &self.bars[self.bars.len() - 1]
    }

    /// The trailing `n` bars, or all of them if the series is shorter.
    pub fn tail(&self, n: usize) -> &[PriceBar] {
        let start = self.bars.len().saturating_sub(n);
        &self.bars[start..]
    }
}
