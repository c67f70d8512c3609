//! Daily price history from the Yahoo Finance chart endpoint.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::models::{PriceBar, PriceSeries};
use crate::trading::SizingError;

use super::types::{ChartResponse, ChartResult};

const CHART_API_BASE: &str = "https://query1.finance.yahoo.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "Mozilla/5.0 (compatible; bracketsizer/0.1)";

/// Source of daily high/low/close history for a symbol.
///
/// Failures surface as `SizingError::DataUnavailable` and are not retried.
#[allow(async_fn_in_trait)]
pub trait PriceHistoryProvider {
    async fn fetch_series(
        &self,
        symbol: &str,
        lookback: chrono::Duration,
    ) -> Result<PriceSeries, SizingError>;
}

/// Client for the Yahoo Finance v8 chart API (read-only).
pub struct YahooClient {
    client: Client,
    base_url: String,
}

impl YahooClient {
    /// Create a new client with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(CHART_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client, base_url })
    }

    async fn fetch_chart(
        &self,
        symbol: &str,
        lookback: chrono::Duration,
    ) -> Result<ChartResponse, SizingError> {
        let end = Utc::now();
        let start = end - lookback;
        let url = format!(
            "{}/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=history",
            self.base_url,
            symbol,
            start.timestamp(),
            end.timestamp()
        );

        debug!(url = %url, "Fetching price history");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SizingError::data_unavailable(symbol, format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SizingError::data_unavailable(symbol, format!("read failed: {}", e)))?;

        chart_from_response(symbol, status, &body)
    }
}

impl PriceHistoryProvider for YahooClient {
    async fn fetch_series(
        &self,
        symbol: &str,
        lookback: chrono::Duration,
    ) -> Result<PriceSeries, SizingError> {
        let chart = self.fetch_chart(symbol, lookback).await?;
        let series = series_from_chart(symbol, chart)?;
        debug!(symbol = %symbol, bars = series.len(), "Loaded price history");
        Ok(series)
    }
}

/// Map a chart endpoint reply to the parsed chart or `DataUnavailable`.
///
/// Unknown symbols come back as 404 with a chart error body, so the body is
/// inspected before the status.
pub(crate) fn chart_from_response(
    symbol: &str,
    status: StatusCode,
    body: &str,
) -> Result<ChartResponse, SizingError> {
    match serde_json::from_str::<ChartResponse>(body) {
        Ok(chart) => {
            if let Some(err) = &chart.chart.error {
                return Err(SizingError::data_unavailable(
                    symbol,
                    format!("{}: {}", err.code, err.description),
                ));
            }
            if !status.is_success() {
                return Err(SizingError::data_unavailable(
                    symbol,
                    format!("HTTP {}", status),
                ));
            }
            Ok(chart)
        }
        Err(e) if status.is_success() => Err(SizingError::data_unavailable(
            symbol,
            format!("unparseable response: {}", e),
        )),
        Err(_) => Err(SizingError::data_unavailable(
            symbol,
            format!("HTTP {} - {}", status, truncate(body, 200)),
        )),
    }
}

/// Turn the first chart result into a series of usable bars.
pub(crate) fn series_from_chart(
    symbol: &str,
    chart: ChartResponse,
) -> Result<PriceSeries, SizingError> {
    let result = chart
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| SizingError::data_unavailable(symbol, "empty chart result"))?;

    let bars = bars_from_chart(symbol, &result);
    if bars.is_empty() {
        return Err(SizingError::data_unavailable(symbol, "no usable bars"));
    }

    PriceSeries::new(symbol.to_uppercase(), bars)
}

/// Zip the column arrays into bars, dropping sessions with missing or
/// inverted prices.
pub(crate) fn bars_from_chart(symbol: &str, result: &ChartResult) -> Vec<PriceBar> {
    let Some(quote) = result.indicators.quote.first() else {
        return Vec::new();
    };

    let sessions = quote.high.len().min(quote.low.len()).min(quote.close.len());
    let mut bars = Vec::with_capacity(sessions);

    for i in 0..sessions {
        let (Some(high), Some(low), Some(close)) = (quote.high[i], quote.low[i], quote.close[i])
        else {
            continue;
        };

        let bar = match PriceBar::new(high.round_dp(4), low.round_dp(4), close.round_dp(4)) {
            Ok(bar) => bar,
            Err(e) => {
                warn!(symbol = %symbol, session = i, error = %e, "Skipping malformed bar");
                continue;
            }
        };

        let bar = match result
            .timestamp
            .get(i)
            .and_then(|ts| Utc.timestamp_opt(*ts, 0).single())
        {
            Some(ts) => bar.at(ts),
            None => bar,
        };

        bars.push(bar);
    }

    bars
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
