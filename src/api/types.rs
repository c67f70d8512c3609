//! Wire types for the Yahoo Finance chart endpoint and the IBKR Client Portal API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// === Yahoo Finance chart ===

/// Top-level response from /v8/finance/chart/{symbol}.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartResponse {
    pub chart: ChartEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartEnvelope {
    #[serde(default)]
    pub result: Option<Vec<ChartResult>>,
    #[serde(default)]
    pub error: Option<ChartError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartError {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartResult {
    #[serde(default)]
    pub meta: Option<ChartMeta>,
    /// Session open times, seconds since epoch
    #[serde(default)]
    pub timestamp: Vec<i64>,
    pub indicators: ChartIndicators,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMeta {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub exchange_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartIndicators {
    #[serde(default)]
    pub quote: Vec<ChartQuote>,
}

/// Column-oriented OHLC arrays. Sessions without a print come back as null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChartQuote {
    #[serde(default)]
    pub high: Vec<Option<Decimal>>,
    #[serde(default)]
    pub low: Vec<Option<Decimal>>,
    #[serde(default)]
    pub close: Vec<Option<Decimal>>,
}

// === IBKR Client Portal ===

/// Integer id that the gateway sometimes sends as a string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortalId {
    Num(i64),
    Text(String),
}

impl PortalId {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PortalId::Num(n) => Some(*n),
            PortalId::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Response from /iserver/auth/status.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub competing: bool,
}

/// Entry from /iserver/secdef/search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecdefSearchEntry {
    pub conid: PortalId,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub company_name: String,
}

/// One order ticket posted to /iserver/account/{account}/orders.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalOrderTicket {
    pub acct_id: String,
    pub conid: i64,
    /// Client order id; the parent of a bracket is referenced by it
    #[serde(rename = "cOID", skip_serializing_if = "Option::is_none")]
    pub c_oid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub order_type: String,
    pub side: String,
    pub quantity: u64,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price: Option<Decimal>,
    pub tif: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortalOrdersRequest {
    pub orders: Vec<PortalOrderTicket>,
}

/// Body for /iserver/reply/{id}.
#[derive(Debug, Clone, Serialize)]
pub struct PortalReplyConfirm {
    pub confirmed: bool,
}

/// Element of an order placement (or reply) response.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortalOrderReply {
    /// Order accepted
    Placed {
        order_id: String,
        #[serde(default)]
        order_status: String,
        /// cOID of the ticket this acknowledges
        #[serde(default)]
        local_order_id: Option<String>,
    },
    /// Gateway wants a confirmation before accepting
    Confirm {
        id: String,
        #[serde(default)]
        message: Vec<String>,
    },
    /// Order rejected
    Rejected { error: String },
}

/// Entry from /portfolio/{account}/positions/{page}.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalPosition {
    #[serde(default)]
    pub acct_id: String,
    pub conid: PortalId,
    #[serde(default)]
    pub contract_desc: String,
    #[serde(default)]
    pub position: Decimal,
    #[serde(default)]
    pub avg_cost: Decimal,
}

/// Response from /iserver/account/orders.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalLiveOrders {
    #[serde(default)]
    pub orders: Vec<PortalLiveOrder>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalLiveOrder {
    pub order_id: PortalId,
    #[serde(default)]
    pub ticker: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub total_size: Decimal,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub status: String,
}
