//! Price statistics used by the sizer: true range, ATR, SMA, lowest low.

use rust_decimal::Decimal;

use crate::models::PriceBar;

use super::SizingError;

/// True range per bar.
///
/// The first bar has no prior close, so its true range is just its
/// high-low range. Every later bar extends its range to cover a gap against
/// the previous close.
pub fn true_ranges(bars: &[PriceBar]) -> Vec<Decimal> {
    let Some(first) = bars.first() else {
        return Vec::new();
    };

    let mut ranges = Vec::with_capacity(bars.len());
    ranges.push(first.range());

    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let bar = &pair[1];
        ranges.push(bar.high.max(prev_close) - bar.low.min(prev_close));
    }

    ranges
}

/// Mean of the last `period` true ranges (all of them if there are fewer).
pub fn average_true_range(bars: &[PriceBar], period: usize) -> Result<Decimal, SizingError> {
    if period == 0 {
        return Err(SizingError::InvalidParameter(
            "ATR period must be at least 1".to_string(),
        ));
    }

    let ranges = true_ranges(bars);
    if ranges.is_empty() {
        return Err(SizingError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }

    let start = ranges.len().saturating_sub(period);
    mean(&ranges[start..])
}

/// Minimum low over the trailing `window` bars (all of them if there are fewer).
pub fn lowest_low(bars: &[PriceBar], window: usize) -> Result<Decimal, SizingError> {
    if window == 0 {
        return Err(SizingError::InvalidParameter(
            "lowest-low window must be at least 1".to_string(),
        ));
    }

    let start = bars.len().saturating_sub(window);
    bars[start..]
        .iter()
        .map(|b| b.low)
        .min()
        .ok_or(SizingError::InsufficientData {
            needed: 1,
            available: 0,
        })
}

/// Simple moving average of the last `period` closes.
///
/// Unlike ATR this is strict: fewer than `period` bars is an error.
pub fn simple_moving_average(bars: &[PriceBar], period: usize) -> Result<Decimal, SizingError> {
    if period == 0 {
        return Err(SizingError::InvalidParameter(
            "SMA period must be at least 1".to_string(),
        ));
    }
    if bars.len() < period {
        return Err(SizingError::InsufficientData {
            needed: period,
            available: bars.len(),
        });
    }

    let closes: Vec<Decimal> = bars[bars.len() - period..].iter().map(|b| b.close).collect();
    mean(&closes)
}

/// Mean close over the trailing `window` bars (all of them if there are fewer).
pub fn average_close(bars: &[PriceBar], window: usize) -> Result<Decimal, SizingError> {
    if window == 0 {
        return Err(SizingError::InvalidParameter(
            "averaging window must be at least 1".to_string(),
        ));
    }

    let start = bars.len().saturating_sub(window);
    let closes: Vec<Decimal> = bars[start..].iter().map(|b| b.close).collect();
    mean(&closes)
}

/// Arithmetic mean.
pub fn mean(values: &[Decimal]) -> Result<Decimal, SizingError> {
    if values.is_empty() {
        return Err(SizingError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }

    let sum: Decimal = values.iter().copied().sum();
    Ok(sum / Decimal::from(values.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(high: Decimal, low: Decimal, close: Decimal) -> PriceBar {
        PriceBar::new(high, low, close).unwrap()
    }

    #[test]
    fn test_true_range_covers_gaps() {
        let bars = vec![
            bar(dec!(10), dec!(9), dec!(9.5)),
            // Gap up: low is above the prior close
            bar(dec!(12), dec!(11), dec!(11.5)),
            // Gap down: high is below the prior close
            bar(dec!(10), dec!(9.5), dec!(9.8)),
        ];

        let ranges = true_ranges(&bars);
        assert_eq!(ranges, vec![dec!(1), dec!(2.5), dec!(2)]);
    }

    #[test]
    fn test_single_bar_atr_is_range() {
        let bars = vec![bar(dec!(105.5), dec!(101.25), dec!(103))];
        assert_eq!(average_true_range(&bars, 21).unwrap(), dec!(4.25));
        assert_eq!(average_true_range(&bars, 1).unwrap(), dec!(4.25));
    }

    #[test]
    fn test_atr_uses_trailing_period() {
        let bars = vec![
            bar(dec!(20), dec!(10), dec!(15)),
            bar(dec!(16), dec!(14), dec!(15)),
            bar(dec!(16), dec!(14), dec!(15)),
        ];

        // Ranges: 10, 2, 2
        assert_eq!(average_true_range(&bars, 2).unwrap(), dec!(2));
        assert_eq!(average_true_range(&bars, 50).unwrap(), dec!(14) / dec!(3));
    }

    #[test]
    fn test_atr_edge_cases() {
        assert!(matches!(
            average_true_range(&[], 21),
            Err(SizingError::InsufficientData { .. })
        ));

        let bars = vec![bar(dec!(10), dec!(9), dec!(9.5))];
        assert!(matches!(
            average_true_range(&bars, 0),
            Err(SizingError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_lowest_low_window() {
        let bars = vec![
            bar(dec!(10), dec!(5), dec!(9)),
            bar(dec!(10), dec!(8), dec!(9)),
            bar(dec!(10), dec!(7), dec!(9)),
        ];

        assert_eq!(lowest_low(&bars, 2).unwrap(), dec!(7));
        assert_eq!(lowest_low(&bars, 14).unwrap(), dec!(5));
    }

    #[test]
    fn test_sma_requires_full_period() {
        let bars = vec![
            bar(dec!(10), dec!(9), dec!(9)),
            bar(dec!(12), dec!(10), dec!(11)),
        ];

        assert_eq!(simple_moving_average(&bars, 2).unwrap(), dec!(10));
        assert!(matches!(
            simple_moving_average(&bars, 3),
            Err(SizingError::InsufficientData {
                needed: 3,
                available: 2
            })
        ));
        // Average close is lenient about short history
        assert_eq!(average_close(&bars, 5).unwrap(), dec!(10));
    }
}
