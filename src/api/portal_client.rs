//! IBKR Client Portal Web API gateway.
//!
//! The Client Portal gateway runs locally and holds the brokerage session;
//! this client only talks REST to it. Bracket legs are held in a
//! `StagingBook` and posted as one linked request once the transmitting leg
//! arrives.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{OrderLeg, OrderSide, OrderType};

use super::gateway::{GatewayEvent, OrderGateway, OrderIdSequence, OrderState, StagingBook};
use super::types::{
    AuthStatus, PortalLiveOrders, PortalOrderReply, PortalOrderTicket, PortalOrdersRequest,
    PortalPosition, PortalReplyConfirm, SecdefSearchEntry,
};

/// Default local gateway address
pub const PORTAL_URL: &str = "https://localhost:5000/v1/api";

/// Confirmation prompts answered before giving up on an order
const MAX_CONFIRMATIONS: usize = 5;

/// Error code reported when the gateway refuses an order
const REJECT_CODE: i32 = 201;

/// Error code reported when acknowledgements cannot be matched to legs
const ACK_MISMATCH_CODE: i32 = 399;

/// Connection settings for the Client Portal gateway.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub account_id: String,
    /// The local gateway ships with a self-signed certificate
    pub accept_invalid_certs: bool,
}

impl PortalConfig {
    /// Read settings from the environment (`.env` is honoured):
    /// - IBKR_ACCOUNT_ID
    /// - IBKR_PORTAL_URL (defaults to the local gateway)
    /// - IBKR_ACCEPT_INVALID_CERTS (defaults to true)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let account_id =
            std::env::var("IBKR_ACCOUNT_ID").context("IBKR_ACCOUNT_ID not set")?;
        let base_url = std::env::var("IBKR_PORTAL_URL").unwrap_or_else(|_| PORTAL_URL.to_string());
        let accept_invalid_certs = match std::env::var("IBKR_ACCEPT_INVALID_CERTS") {
            Ok(v) => parse_flag(&v).context("Invalid IBKR_ACCEPT_INVALID_CERTS")?,
            Err(_) => true,
        };

        Ok(Self {
            base_url,
            account_id,
            accept_invalid_certs,
        })
    }
}

fn parse_flag(s: &str) -> Result<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{}'", other)),
    }
}

/// Live gateway backed by the Client Portal REST API.
pub struct PortalGateway {
    http: Client,
    config: PortalConfig,
    ids: OrderIdSequence,
    staging: Mutex<StagingBook>,
    conids: Mutex<HashMap<String, i64>>,
    events: UnboundedSender<GatewayEvent>,
}

impl PortalGateway {
    /// Create a client and check that the brokerage session is authenticated.
    pub async fn connect(config: PortalConfig) -> Result<(Self, UnboundedReceiver<GatewayEvent>)> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .context("Failed to create HTTP client")?;

        let (tx, rx) = mpsc::unbounded_channel();

        // Client order ids only need to be unique per account
        let first_id = Utc::now().timestamp();

        let gateway = Self {
            http,
            config,
            ids: OrderIdSequence::new(first_id),
            staging: Mutex::new(StagingBook::new()),
            conids: Mutex::new(HashMap::new()),
            events: tx,
        };

        let status = gateway.auth_status().await?;
        if !status.authenticated {
            bail!(
                "Client Portal session at {} is not authenticated; log in first",
                gateway.config.base_url
            );
        }
        if status.competing {
            warn!("Another session is competing for this brokerage login");
        }

        info!(account = %gateway.config.account_id, "Connected to Client Portal");
        gateway.emit(GatewayEvent::NextValidId(first_id));

        Ok((gateway, rx))
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    async fn auth_status(&self) -> Result<AuthStatus> {
        let url = format!("{}/iserver/auth/status", self.config.base_url);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .context("Client Portal unreachable")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Auth status failed: {} - {}", status, text);
        }

        resp.json().await.context("Failed to parse auth status")
    }

    /// Contract id for a US stock symbol, cached per session.
    async fn resolve_conid(&self, symbol: &str) -> Result<i64> {
        let symbol = symbol.to_uppercase();
        if let Some(conid) = self.conids.lock().await.get(&symbol) {
            return Ok(*conid);
        }

        let url = format!("{}/iserver/secdef/search", self.config.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("symbol", symbol.as_str()), ("secType", "STK")])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Contract search failed for {}: {} - {}", symbol, status, text);
        }

        let entries: Vec<SecdefSearchEntry> = resp
            .json()
            .await
            .context("Failed to parse contract search")?;

        let conid = entries
            .iter()
            .find(|e| e.symbol.eq_ignore_ascii_case(&symbol))
            .or_else(|| entries.first())
            .and_then(|e| e.conid.as_i64())
            .ok_or_else(|| anyhow!("No contract found for {}", symbol))?;

        debug!(symbol = %symbol, conid = conid, "Resolved contract");
        self.conids.lock().await.insert(symbol, conid);
        Ok(conid)
    }

    async fn post_orders(&self, request: &PortalOrdersRequest) -> Result<Vec<PortalOrderReply>> {
        let url = format!(
            "{}/iserver/account/{}/orders",
            self.config.base_url, self.config.account_id
        );
        let resp = self.http.post(&url).json(request).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Order placement failed: {} - {}", status, text);
        }

        resp.json().await.context("Failed to parse order response")
    }

    async fn confirm(&self, reply_id: &str) -> Result<Vec<PortalOrderReply>> {
        let url = format!("{}/iserver/reply/{}", self.config.base_url, reply_id);
        let resp = self
            .http
            .post(&url)
            .json(&PortalReplyConfirm { confirmed: true })
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Order confirmation failed: {} - {}", status, text);
        }

        resp.json().await.context("Failed to parse reply response")
    }

    /// Post an armed group and answer confirmation prompts until every
    /// ticket is placed or rejected.
    async fn transmit_group(&self, symbol: &str, group: &[OrderLeg]) -> Result<()> {
        let conid = self.resolve_conid(symbol).await?;
        let request = PortalOrdersRequest {
            orders: group
                .iter()
                .map(|leg| ticket_for_leg(&self.config.account_id, conid, leg))
                .collect(),
        };

        let mut replies = self.post_orders(&request).await?;
        let mut acks = Vec::new();
        let mut confirmations = 0;

        loop {
            match next_reply_step(replies, &mut acks, confirmations) {
                ReplyStep::Done => break,
                ReplyStep::Confirm(reply_id) => {
                    debug!(reply_id = %reply_id, "Confirming order prompt");
                    confirmations += 1;
                    replies = self.confirm(&reply_id).await?;
                }
                ReplyStep::Rejected(error) => {
                    self.emit(rejection_event(group, &error));
                    bail!("Order rejected by Client Portal: {}", error);
                }
                ReplyStep::TooManyPrompts => {
                    let message =
                        format!("gave up after {} confirmation prompts", MAX_CONFIRMATIONS);
                    self.emit(rejection_event(group, &message));
                    bail!("Order not placed: {}", message);
                }
            }
        }

        let events = ack_events(group, acks);
        if events.iter().any(|e| matches!(e, GatewayEvent::Error { .. })) {
            warn!(
                symbol = %symbol,
                legs = group.len(),
                "Client Portal acknowledgements do not match the bracket legs"
            );
        }
        for event in events {
            self.emit(event);
        }

        info!(symbol = %symbol, legs = group.len(), "Bracket transmitted to Client Portal");
        Ok(())
    }
}

impl OrderGateway for PortalGateway {
    async fn reserve_order_ids(&self, count: u32) -> Result<i64> {
        Ok(self.ids.reserve(count))
    }

    async fn place_order(&self, symbol: &str, leg: &OrderLeg) -> Result<()> {
        let armed = self.staging.lock().await.stage(leg.clone());

        match armed {
            Some(group) => self.transmit_group(symbol, &group).await,
            None => {
                debug!(order_id = leg.order_id, symbol = %symbol, "Leg staged locally");
                Ok(())
            }
        }
    }

    async fn discard_staged(&self, group: i64) -> Result<usize> {
        let dropped = self.staging.lock().await.discard(group);
        for leg in &dropped {
            self.emit(GatewayEvent::status(
                leg.order_id,
                OrderState::Cancelled,
                leg.quantity,
            ));
        }
        if !dropped.is_empty() {
            warn!(group = group, legs = dropped.len(), "Staged legs discarded before transmit");
        }
        Ok(dropped.len())
    }

    async fn request_positions(&self) -> Result<()> {
        let url = format!(
            "{}/portfolio/{}/positions/0",
            self.config.base_url, self.config.account_id
        );
        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Failed to get positions: {} - {}", status, text);
        }

        let positions: Vec<PortalPosition> =
            resp.json().await.context("Failed to parse positions")?;

        for event in position_events(&self.config.account_id, positions) {
            self.emit(event);
        }
        self.emit(GatewayEvent::PositionEnd);
        Ok(())
    }

    async fn request_open_orders(&self) -> Result<()> {
        let url = format!("{}/iserver/account/orders", self.config.base_url);
        let resp = self.http.get(&url).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("Failed to get live orders: {} - {}", status, text);
        }

        let live: PortalLiveOrders = resp.json().await.context("Failed to parse live orders")?;

        for event in open_order_events(live) {
            self.emit(event);
        }
        self.emit(GatewayEvent::OpenOrderEnd);
        Ok(())
    }
}

/// Client order id of a bracket's parent leg.
fn bracket_coid(group_id: i64) -> String {
    format!("bracket-{}", group_id)
}

/// Client order id of one leg. Child ids extend their parent's.
fn leg_coid(leg: &OrderLeg) -> String {
    match leg.parent_id {
        Some(parent) => format!("{}-{}", bracket_coid(parent), leg.order_id),
        None => bracket_coid(leg.order_id),
    }
}

fn ticket_for_leg(account_id: &str, conid: i64, leg: &OrderLeg) -> PortalOrderTicket {
    PortalOrderTicket {
        acct_id: account_id.to_string(),
        conid,
        c_oid: Some(leg_coid(leg)),
        parent_id: leg.parent_id.map(bracket_coid),
        order_type: leg.order_type.as_str().to_string(),
        side: leg.action.as_str().to_string(),
        quantity: leg.quantity,
        price: leg.price(),
        tif: leg.tif.as_str().to_string(),
    }
}

/// One ticket the gateway accepted.
#[derive(Debug, Clone, PartialEq)]
struct PlacedAck {
    broker_id: String,
    status: String,
    local_id: Option<String>,
}

/// What to do after reading a batch of order replies.
#[derive(Debug, Clone, PartialEq)]
enum ReplyStep {
    Done,
    /// Answer this prompt and read the next batch
    Confirm(String),
    Rejected(String),
    TooManyPrompts,
}

/// Fold one batch of replies into `acks`. `confirmations` is the number of
/// prompts already answered for this group.
fn next_reply_step(
    replies: Vec<PortalOrderReply>,
    acks: &mut Vec<PlacedAck>,
    confirmations: usize,
) -> ReplyStep {
    let mut prompt = None;

    for reply in replies {
        match reply {
            PortalOrderReply::Placed {
                order_id,
                order_status,
                local_order_id,
            } => acks.push(PlacedAck {
                broker_id: order_id,
                status: order_status,
                local_id: local_order_id,
            }),
            PortalOrderReply::Confirm { id, message } => {
                debug!(reply_id = %id, message = ?message, "Order prompt");
                prompt = Some(id);
            }
            PortalOrderReply::Rejected { error } => return ReplyStep::Rejected(error),
        }
    }

    match prompt {
        None => ReplyStep::Done,
        Some(_) if confirmations >= MAX_CONFIRMATIONS => ReplyStep::TooManyPrompts,
        Some(id) => ReplyStep::Confirm(id),
    }
}

fn rejection_event(group: &[OrderLeg], message: &str) -> GatewayEvent {
    GatewayEvent::Error {
        order_id: group.first().map(|l| l.group_id()),
        code: REJECT_CODE,
        message: message.to_string(),
    }
}

/// Status events for acknowledged legs, matched by cOID.
///
/// Acks without a cOID are matched by position only when every ack lacks
/// one and the counts agree. Anything left over is reported as an `Error`.
fn ack_events(group: &[OrderLeg], acks: Vec<PlacedAck>) -> Vec<GatewayEvent> {
    let by_position = acks.len() == group.len() && acks.iter().all(|a| a.local_id.is_none());
    let ack_count = acks.len();

    let mut events = Vec::with_capacity(ack_count + 1);
    let mut matched = HashSet::new();
    let mut unmatched = Vec::new();

    for (i, ack) in acks.into_iter().enumerate() {
        let leg = match &ack.local_id {
            Some(local) => group.iter().find(|l| leg_coid(l) == *local),
            None if by_position => group.get(i),
            None => None,
        };

        let Some(leg) = leg.filter(|l| matched.insert(l.order_id)) else {
            unmatched.push(ack.broker_id);
            continue;
        };

        events.push(GatewayEvent::OrderStatus {
            order_id: leg.order_id,
            status: OrderState::from_status(&ack.status),
            broker_id: Some(ack.broker_id),
            filled: Decimal::ZERO,
            remaining: Decimal::from(leg.quantity),
        });
    }

    if !unmatched.is_empty() || matched.len() != group.len() {
        events.push(GatewayEvent::Error {
            order_id: group.first().map(|l| l.group_id()),
            code: ACK_MISMATCH_CODE,
            message: format!(
                "{} of {} legs acknowledged ({} acks); unmatched broker ids: [{}]",
                matched.len(),
                group.len(),
                ack_count,
                unmatched.join(", ")
            ),
        });
    }

    events
}

fn position_events(account_id: &str, positions: Vec<PortalPosition>) -> Vec<GatewayEvent> {
    positions
        .into_iter()
        .filter(|p| !p.position.is_zero())
        .map(|p| GatewayEvent::Position {
            account: if p.acct_id.is_empty() {
                account_id.to_string()
            } else {
                p.acct_id
            },
            symbol: p.contract_desc,
            quantity: p.position,
            avg_cost: p.avg_cost,
        })
        .collect()
}

fn open_order_events(live: PortalLiveOrders) -> Vec<GatewayEvent> {
    let mut events = Vec::with_capacity(live.orders.len());

    for order in live.orders {
        let (Some(order_id), Some(action), Some(order_type)) = (
            order.order_id.as_i64(),
            OrderSide::from_str(&order.side),
            OrderType::from_code(&order.order_type),
        ) else {
            warn!(
                order_id = ?order.order_id,
                side = %order.side,
                order_type = %order.order_type,
                "Skipping unrecognised live order"
            );
            continue;
        };

        events.push(GatewayEvent::OpenOrder {
            order_id,
            symbol: order.ticker,
            action,
            order_type,
            quantity: order.total_size.trunc().to_u64().unwrap_or(0),
            price: order.price,
            status: OrderState::from_status(&order.status),
        });
    }

    events
}
