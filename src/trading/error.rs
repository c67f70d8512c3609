//! Error types for sizing calculations and price history retrieval.

/// Errors returned synchronously by sizing operations.
///
/// The sizer never retries; recovery (e.g. picking another stop-loss
/// candidate) is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SizingError {
    /// Not enough bars to compute the requested statistic.
    #[error("insufficient price history: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Stop-loss, entry, and take-profit ordering violated, or risk per share <= 0.
    #[error("invalid risk: {0}")]
    InvalidRisk(String),

    /// Price history could not be supplied for the symbol.
    #[error("price data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Configuration or parameter out of its allowed range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl SizingError {
    pub fn data_unavailable(symbol: &str, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Arithmetic on `what` left the decimal range.
    pub fn overflow(what: &str) -> Self {
        Self::InvalidParameter(format!("{} overflows the decimal range", what))
    }
}
