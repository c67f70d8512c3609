//! In-process gateway that acknowledges orders without routing them anywhere.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{OrderLeg, OrderType};

use super::gateway::{GatewayEvent, OrderGateway, OrderIdSequence, OrderState, StagingBook};

/// Error code reported for legs the paper broker refuses.
const REJECT_CODE: i32 = 321;

/// First order id of a fresh paper book.
const PAPER_FIRST_ID: i64 = 1;

/// Armed leg resting at the paper broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub symbol: String,
    pub leg: OrderLeg,
}

/// On-disk state of the paper broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperBook {
    pub next_id: i64,
    #[serde(default)]
    pub working: Vec<WorkingOrder>,
}

impl Default for PaperBook {
    fn default() -> Self {
        Self {
            next_id: PAPER_FIRST_ID,
            working: Vec::new(),
        }
    }
}

impl PaperBook {
    /// Load a book from a JSON file. A missing file is an empty book.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read paper book {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse paper book {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write paper book {}", path.display()))
    }
}

/// Paper broker: stages and arms brackets, keeps armed legs as working
/// orders, never fills.
pub struct PaperGateway {
    ids: OrderIdSequence,
    staging: Mutex<StagingBook>,
    working: Mutex<Vec<WorkingOrder>>,
    /// Where working orders and the id sequence are kept between runs
    book_path: Option<PathBuf>,
    events: UnboundedSender<GatewayEvent>,
}

impl PaperGateway {
    /// Open an in-memory session. The receiver yields `NextValidId(first_id)` first.
    pub fn connect(first_id: i64) -> (Self, UnboundedReceiver<GatewayEvent>) {
        Self::with_book(
            PaperBook {
                next_id: first_id,
                working: Vec::new(),
            },
            None,
        )
    }

    /// Open a session backed by a JSON book. Working orders armed in earlier
    /// runs are restored and ids continue where they left off.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, UnboundedReceiver<GatewayEvent>)> {
        let path = path.into();
        let book = PaperBook::load(&path)?;
        info!(
            path = %path.display(),
            working = book.working.len(),
            next_id = book.next_id,
            "Paper book loaded"
        );
        Ok(Self::with_book(book, Some(path)))
    }

    fn with_book(
        book: PaperBook,
        book_path: Option<PathBuf>,
    ) -> (Self, UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let gateway = Self {
            ids: OrderIdSequence::new(book.next_id),
            staging: Mutex::new(StagingBook::new()),
            working: Mutex::new(book.working),
            book_path,
            events: tx,
        };
        gateway.emit(GatewayEvent::NextValidId(book.next_id));

        (gateway, rx)
    }

    /// Number of armed legs currently working.
    pub async fn working_orders(&self) -> usize {
        self.working.lock().await.len()
    }

    /// Number of groups with legs held for a transmit leg.
    pub async fn staged_groups(&self) -> usize {
        self.staging.lock().await.pending_groups()
    }

    fn emit(&self, event: GatewayEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn reject(&self, leg: &OrderLeg, message: String) -> Result<()> {
        self.emit(GatewayEvent::Error {
            order_id: Some(leg.order_id),
            code: REJECT_CODE,
            message: message.clone(),
        });
        bail!("Order {} rejected: {}", leg.order_id, message)
    }

    fn persist(&self, working: &[WorkingOrder]) -> Result<()> {
        let Some(path) = &self.book_path else {
            return Ok(());
        };
        let book = PaperBook {
            next_id: self.ids.peek(),
            working: working.to_vec(),
        };
        book.save(path)?;
        debug!(path = %path.display(), working = working.len(), "Paper book saved");
        Ok(())
    }
}

impl OrderGateway for PaperGateway {
    async fn reserve_order_ids(&self, count: u32) -> Result<i64> {
        let first = self.ids.reserve(count);
        if self.book_path.is_some() {
            let working = self.working.lock().await;
            self.persist(&working)?;
        }
        Ok(first)
    }

    async fn place_order(&self, symbol: &str, leg: &OrderLeg) -> Result<()> {
        if leg.quantity == 0 {
            return self.reject(leg, "quantity must be positive".to_string());
        }
        if leg.order_type != OrderType::Market && leg.price().is_none() {
            return self.reject(leg, format!("{} order without a price", leg.order_type.as_str()));
        }

        let armed = self.staging.lock().await.stage(leg.clone());

        let Some(group) = armed else {
            debug!(order_id = leg.order_id, symbol = %symbol, "Leg staged");
            self.emit(GatewayEvent::status(
                leg.order_id,
                OrderState::PreSubmitted,
                leg.quantity,
            ));
            return Ok(());
        };

        info!(
            group = leg.group_id(),
            legs = group.len(),
            symbol = %symbol,
            "Paper bracket armed"
        );

        let mut working = self.working.lock().await;
        for armed_leg in group {
            self.emit(GatewayEvent::status(
                armed_leg.order_id,
                OrderState::Submitted,
                armed_leg.quantity,
            ));
            self.emit(GatewayEvent::open_order(symbol, &armed_leg, OrderState::Submitted));
            working.push(WorkingOrder {
                symbol: symbol.to_string(),
                leg: armed_leg,
            });
        }

        self.persist(&working)
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
            warn!(group = group, legs = dropped.len(), "Staged paper legs discarded");
        }
        Ok(dropped.len())
    }

    async fn request_positions(&self) -> Result<()> {
        // Nothing ever fills on paper
        self.emit(GatewayEvent::PositionEnd);
        Ok(())
    }

    async fn request_open_orders(&self) -> Result<()> {
        let working = self.working.lock().await;
        for order in working.iter() {
            self.emit(GatewayEvent::open_order(
                &order.symbol,
                &order.leg,
                OrderState::Submitted,
            ));
        }
        self.emit(GatewayEvent::OpenOrderEnd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::gateway::{drain_events, place_bracket, submit_bracket};
    use crate::models::{BindingConstraint, BracketOrder, OrderSide, SizingResult};
    use rust_decimal_macros::dec;

    fn sizing() -> SizingResult {
        SizingResult {
            entry_price: dec!(121.605),
            stop_loss_price: dec!(111.605),
            take_profit_price: dec!(151.605),
            share_count: 164,
            risk_cap_shares: dec!(500),
            capital_cap_shares: dec!(164.46),
            binding: BindingConstraint::Capital,
        }
    }

    fn statuses(events: &[GatewayEvent]) -> Vec<(i64, OrderState)> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::OrderStatus {
                    order_id, status, ..
                } => Some((*order_id, status.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_announces_next_id() {
        let (_gateway, mut rx) = PaperGateway::connect(500);
        assert_eq!(drain_events(&mut rx), vec![GatewayEvent::NextValidId(500)]);
    }

    #[test]
    fn test_bracket_staged_then_armed() {
        tokio_test::block_on(async {
            let (gateway, mut rx) = PaperGateway::connect(1000);
            drain_events(&mut rx);

            let bracket =
                BracketOrder::from_sizing(1000, "AAPL", OrderSide::Buy, &sizing(), dec!(0.01))
                    .unwrap();

            gateway.place_order("AAPL", &bracket.parent).await.unwrap();
            gateway.place_order("AAPL", &bracket.take_profit).await.unwrap();
            assert_eq!(gateway.working_orders().await, 0);
            assert_eq!(
                statuses(&drain_events(&mut rx)),
                vec![
                    (1000, OrderState::PreSubmitted),
                    (1001, OrderState::PreSubmitted)
                ]
            );

            gateway.place_order("AAPL", &bracket.stop_loss).await.unwrap();
            let events = drain_events(&mut rx);
            assert_eq!(
                statuses(&events),
                vec![
                    (1000, OrderState::Submitted),
                    (1001, OrderState::Submitted),
                    (1002, OrderState::Submitted)
                ]
            );
            let open = events
                .iter()
                .filter(|e| matches!(e, GatewayEvent::OpenOrder { .. }))
                .count();
            assert_eq!(open, 3);
            assert_eq!(gateway.working_orders().await, 3);
        });
    }

    #[tokio::test]
    async fn test_place_bracket_uses_reserved_ids() {
        let (gateway, mut rx) = PaperGateway::connect(42);
        drain_events(&mut rx);

        let first = place_bracket(&gateway, "msft", OrderSide::Buy, &sizing(), dec!(0.01))
            .await
            .unwrap();
        let second = place_bracket(&gateway, "msft", OrderSide::Buy, &sizing(), dec!(0.01))
            .await
            .unwrap();

        assert_eq!(first.parent_id(), 42);
        assert_eq!(first.stop_loss.order_id, 44);
        assert_eq!(second.parent_id(), 45);
        assert_eq!(gateway.working_orders().await, 6);
    }

    #[tokio::test]
    async fn test_open_orders_replay_then_end() {
        let (gateway, mut rx) = PaperGateway::connect(1);
        let bracket =
            BracketOrder::from_sizing(1, "AAPL", OrderSide::Buy, &sizing(), dec!(0.01)).unwrap();
        submit_bracket(&gateway, &bracket).await.unwrap();
        drain_events(&mut rx);

        gateway.request_open_orders().await.unwrap();
        let events = drain_events(&mut rx);

        assert_eq!(events.len(), 4);
        assert_eq!(events.last(), Some(&GatewayEvent::OpenOrderEnd));
        assert!(matches!(
            &events[1],
            GatewayEvent::OpenOrder { order_id: 2, price: Some(p), .. } if *p == dec!(151.61)
        ));
    }

    #[tokio::test]
    async fn test_positions_empty() {
        let (gateway, mut rx) = PaperGateway::connect(1);
        drain_events(&mut rx);

        gateway.request_positions().await.unwrap();
        assert_eq!(drain_events(&mut rx), vec![GatewayEvent::PositionEnd]);
    }

    #[tokio::test]
    async fn test_zero_quantity_rejected_with_event() {
        let (gateway, mut rx) = PaperGateway::connect(1);
        drain_events(&mut rx);

        let mut bracket =
            BracketOrder::from_sizing(1, "AAPL", OrderSide::Buy, &sizing(), dec!(0.01)).unwrap();
        bracket.parent.quantity = 0;

        assert!(submit_bracket(&gateway, &bracket).await.is_err());
        let events = drain_events(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::Error { order_id: Some(1), code: REJECT_CODE, .. }]
        ));
        assert_eq!(gateway.working_orders().await, 0);
    }

    #[tokio::test]
    async fn test_failed_child_leg_discards_staged_group() {
        let (gateway, mut rx) = PaperGateway::connect(1);
        drain_events(&mut rx);

        let mut bracket =
            BracketOrder::from_sizing(1, "AAPL", OrderSide::Buy, &sizing(), dec!(0.01)).unwrap();
        bracket.take_profit.quantity = 0;

        assert!(submit_bracket(&gateway, &bracket).await.is_err());
        assert_eq!(gateway.staged_groups().await, 0);
        assert_eq!(gateway.working_orders().await, 0);

        let events = drain_events(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![(1, OrderState::PreSubmitted), (1, OrderState::Cancelled)]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::Error { order_id: Some(2), code: REJECT_CODE, .. }
        )));

        // The same ids can be resubmitted once the quantity is fixed
        bracket.take_profit.quantity = bracket.parent.quantity;
        submit_bracket(&gateway, &bracket).await.unwrap();
        assert_eq!(gateway.working_orders().await, 3);
    }

    #[tokio::test]
    async fn test_discard_of_unknown_group_is_quiet() {
        let (gateway, mut rx) = PaperGateway::connect(1);
        drain_events(&mut rx);

        assert_eq!(gateway.discard_staged(99).await.unwrap(), 0);
        assert!(drain_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_book_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "bracketsizer-paper-{}-reopen.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let (gateway, mut rx) = PaperGateway::open(&path).unwrap();
            assert_eq!(
                drain_events(&mut rx),
                vec![GatewayEvent::NextValidId(PAPER_FIRST_ID)]
            );
            place_bracket(&gateway, "AAPL", OrderSide::Buy, &sizing(), dec!(0.01))
                .await
                .unwrap();
        }

        let (gateway, mut rx) = PaperGateway::open(&path).unwrap();
        assert_eq!(drain_events(&mut rx), vec![GatewayEvent::NextValidId(4)]);
        assert_eq!(gateway.working_orders().await, 3);

        gateway.request_open_orders().await.unwrap();
        let events = drain_events(&mut rx);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[0],
            GatewayEvent::OpenOrder { order_id: 1, symbol, .. } if symbol == "AAPL"
        ));
        assert_eq!(events.last(), Some(&GatewayEvent::OpenOrderEnd));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_book_is_empty() {
        let path = std::env::temp_dir().join("bracketsizer-paper-does-not-exist.json");
        let book = PaperBook::load(&path).unwrap();
        assert_eq!(book, PaperBook::default());
        assert_eq!(book.next_id, PAPER_FIRST_ID);
    }

    #[test]
    fn test_corrupt_book_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "bracketsizer-paper-{}-corrupt.json",
            std::process::id()
        ));
        std::fs::write(&path, "not json").unwrap();
        assert!(PaperBook::load(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
