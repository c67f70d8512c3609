//! Sizer configuration.

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::SizingError;

/// Tunable parameters for entry, stop-loss, and take-profit calculation.
///
/// Fractions are on a 0-1 scale (`dec!(0.005)` = 0.5%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerConfig {
    /// Markup over the last high for the stop-buy entry (0.0 to 1.0)
    pub entry_premium_pct: Decimal,

    /// Trailing windows for average-close entry candidates
    pub average_close_windows: Vec<usize>,

    /// Lookback for the average true range
    pub atr_period: usize,

    /// ATR multiple subtracted from entry for the ATR stop
    pub atr_multiplier: Decimal,

    /// Trailing window for the lowest-low stop
    pub lowest_low_window: usize,

    /// Distance below entry for the percentage stop (0.0 to 1.0)
    pub stop_loss_pct: Decimal,

    /// Period for the SMA stop; disabled when unset
    pub sma_stop_period: Option<usize>,

    /// Reward/risk multiples offered as take-profit candidates
    pub reward_risk_ratios: Vec<Decimal>,

    /// Fixed take-profit distance above entry (0.0 to 1.0); disabled when unset
    pub take_profit_pct: Option<Decimal>,

    /// Minimum price increment for submitted orders
    pub price_tick: Decimal,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            entry_premium_pct: dec!(0.005),       // 0.5% above last high
            average_close_windows: vec![5, 21],   // One week, one month
            atr_period: 21,
            atr_multiplier: dec!(2),
            lowest_low_window: 14,
            stop_loss_pct: dec!(0.10),            // 10% below entry
            sma_stop_period: None,
            reward_risk_ratios: vec![dec!(2), dec!(3)],
            take_profit_pct: Some(dec!(0.20)),    // 20% above entry
            price_tick: dec!(0.01),
        }
    }
}

impl SizerConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every candidate meaningless.
    ///
    /// A stop-loss percentage of 1 or more is allowed here; the resulting
    /// candidate is flagged invalid instead.
    pub fn validate(&self) -> Result<(), SizingError> {
        if self.entry_premium_pct < Decimal::ZERO {
            return Err(SizingError::InvalidParameter(format!(
                "entry premium must not be negative, got {}",
                self.entry_premium_pct
            )));
        }
        if self.atr_period == 0 || self.lowest_low_window == 0 {
            return Err(SizingError::InvalidParameter(
                "ATR period and lowest-low window must be at least 1".to_string(),
            ));
        }
        if self.average_close_windows.contains(&0) || self.sma_stop_period == Some(0) {
            return Err(SizingError::InvalidParameter(
                "averaging windows must be at least 1".to_string(),
            ));
        }
        if self.atr_multiplier <= Decimal::ZERO {
            return Err(SizingError::InvalidParameter(format!(
                "ATR multiplier must be positive, got {}",
                self.atr_multiplier
            )));
        }
        if self.reward_risk_ratios.iter().any(|r| *r <= Decimal::ZERO) {
            return Err(SizingError::InvalidParameter(
                "reward/risk ratios must be positive".to_string(),
            ));
        }
        if self.price_tick <= Decimal::ZERO {
            return Err(SizingError::InvalidParameter(format!(
                "price tick must be positive, got {}",
                self.price_tick
            )));
        }
        Ok(())
    }
}
