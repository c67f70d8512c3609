//! Account risk budget passed explicitly into every sizing call.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::trading::SizingError;

/// Risk budget for a single sizing request.
///
/// Percentages are expressed on a 0-100 scale (e.g. `dec!(5)` = 5%).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Total account value in USD
    pub account_capital: Decimal,

    /// Maximum loss allowed on one position, percent of capital
    pub risk_per_position_pct: Decimal,

    /// Maximum loss allowed across the portfolio, percent of capital
    pub total_portfolio_risk_pct: Decimal,

    /// Number of position slots the capital is split across
    pub position_count: u32,

    /// Optional fixed-fraction cap on a single position's value, percent of capital
    #[serde(default)]
    pub max_position_pct: Option<Decimal>,
}

impl RiskParameters {
    /// Create and validate a risk budget.
    pub fn new(
        account_capital: Decimal,
        risk_per_position_pct: Decimal,
        total_portfolio_risk_pct: Decimal,
        position_count: u32,
    ) -> Result<Self, SizingError> {
        let params = Self {
            account_capital,
            risk_per_position_pct,
            total_portfolio_risk_pct,
            position_count,
            max_position_pct: None,
        };
        params.validate()?;
        Ok(params)
    }

    /// Add a fixed-fraction per-position capital cap.
    pub fn with_max_position_pct(mut self, pct: Decimal) -> Result<Self, SizingError> {
        self.max_position_pct = Some(pct);
        self.validate()?;
        Ok(self)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), SizingError> {
        if self.account_capital <= Decimal::ZERO {
            return Err(SizingError::InvalidParameter(format!(
                "account capital must be positive, got {}",
                self.account_capital
            )));
        }

        check_pct("risk per position", self.risk_per_position_pct)?;
        check_pct("total portfolio risk", self.total_portfolio_risk_pct)?;
        if let Some(pct) = self.max_position_pct {
            check_pct("max position", pct)?;
        }

        if self.position_count == 0 {
            return Err(SizingError::InvalidParameter(
                "position count must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Dollar risk allowed on one trade: the per-position budget, capped by
    /// the portfolio-wide budget.
    pub fn max_risk_dollars(&self) -> Result<Decimal, SizingError> {
        let per_position = percent_of(self.account_capital, self.risk_per_position_pct)?;
        let portfolio = percent_of(self.account_capital, self.total_portfolio_risk_pct)?;
        Ok(per_position.min(portfolio))
    }

    /// Dollar value allowed in one position: capital split across slots,
    /// further capped by `max_position_pct` when set.
    pub fn max_capital_dollars(&self) -> Result<Decimal, SizingError> {
        let per_slot = self
            .account_capital
            .checked_div(Decimal::from(self.position_count))
            .ok_or_else(|| {
                SizingError::InvalidParameter("position count must be at least 1".to_string())
            })?;

        match self.max_position_pct {
            Some(pct) => Ok(per_slot.min(percent_of(self.account_capital, pct)?)),
            None => Ok(per_slot),
        }
    }
}

fn percent_of(amount: Decimal, pct: Decimal) -> Result<Decimal, SizingError> {
    amount
        .checked_mul(pct)
        .map(|v| v / dec!(100))
        .ok_or_else(|| SizingError::overflow("capital budget"))
}

fn check_pct(name: &str, value: Decimal) -> Result<(), SizingError> {
    if value <= Decimal::ZERO || value > dec!(100) {
        return Err(SizingError::InvalidParameter(format!(
            "{} must be in (0, 100], got {}",
            name, value
        )));
    }
    Ok(())
}
