//! Matching engine - the single writer over the book, trade log and
//! position ledger
//!
//! Every mutation happens under one write lock, so matching is
//! synchronous with placement and cancellations always observe the true
//! current state. Events are published only after the lock is released.

use crate::events::{EventHub, MarketEvent};
use crate::order::{Order, OrderSource, OrderStatus, OrderType, PlaceOrderRequest, Side};
use crate::orderbook::{OrderBook, QuoteSync};
use crate::position::{PositionLedger, PositionReport};
use crate::provider::{Provider, ProviderStatus};
use crate::types::{BookStats, OrderBookSnapshot, OrderId, OwnerId, Price, Quantity, Trade};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;

/// Recent trades retained for queries
const TRADE_HISTORY_LIMIT: usize = 1000;
/// Baseline size of a freshly quoted provider ask, in tokens
const QUOTE_SIZE_BASE: u64 = 50_000;
/// Random extra applied on top of the baseline
const QUOTE_SIZE_JITTER: u64 = 50_000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Order quantity must be positive")]
    InvalidQuantity,
    #[error("Limit order requires a positive price")]
    InvalidPrice,
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),
    #[error("Not the order owner: {0}")]
    NotOrderOwner(OrderId),
    #[error("Order {order_id} is not cancellable: {status:?}")]
    NotCancellable {
        order_id: OrderId,
        status: OrderStatus,
    },
    #[error("Provider quotes cannot be cancelled: {0}")]
    ProviderQuoteImmutable(OrderId),
    #[error("Internal error: {0}")]
    Internal(String),
}

struct EngineState {
    book: OrderBook,
    positions: PositionLedger,
    trades: VecDeque<Trade>,
    trades_executed: u64,
}

/// The matching engine for the compute-token market
pub struct MatchingEngine {
    state: RwLock<EngineState>,
    order_counter: AtomicU64,
    events: EventHub,
}

impl MatchingEngine {
    pub fn new(events: EventHub) -> Self {
        Self {
            state: RwLock::new(EngineState {
                book: OrderBook::new(),
                positions: PositionLedger::new(),
                trades: VecDeque::new(),
                trades_executed: 0,
            }),
            order_counter: AtomicU64::new(1),
            events,
        }
    }

    /// Generate a new order ID
    fn next_order_id(&self) -> OrderId {
        OrderId(self.order_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Place a new order. Validation is synchronous; by the time this
    /// returns, all matching for the order has completed.
    pub fn place_order(&self, request: PlaceOrderRequest) -> Result<(Order, Vec<Trade>), EngineError> {
        let quantity = Quantity::from_f64(request.quantity);
        if !quantity.is_positive() {
            return Err(EngineError::InvalidQuantity);
        }

        let owner = OwnerId::new(request.owner_id);
        let order_id = self.next_order_id();
        let order = match request.order_type {
            OrderType::Limit => {
                let price = request
                    .price
                    .map(Price::from_f64)
                    .filter(Price::is_positive)
                    .ok_or(EngineError::InvalidPrice)?;
                Order::new_limit(order_id, owner, OrderSource::User, request.side, price, quantity)
            }
            // Any price supplied with a market order is ignored
            OrderType::Market => Order::new_market(order_id, owner, request.side, quantity),
        };

        let mut events = Vec::new();
        let (order, trades) = {
            let mut state = self
                .state
                .write()
                .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;

            let (order, trades) = state.book.place_order(order);

            for trade in &trades {
                let buyer = state
                    .positions
                    .apply(&trade.buyer, Side::Buy, trade.price, trade.quantity);
                let seller = state
                    .positions
                    .apply(&trade.seller, Side::Sell, trade.price, trade.quantity);
                state.trades.push_back(trade.clone());
                state.trades_executed += 1;
                while state.trades.len() > TRADE_HISTORY_LIMIT {
                    state.trades.pop_front();
                }
                events.push(MarketEvent::TradeExecuted(trade.clone()));

                let maker_id = match order.side {
                    Side::Buy => trade.sell_order_id,
                    Side::Sell => trade.buy_order_id,
                };
                if let Some(maker) = state.book.get_order(&maker_id) {
                    events.push(MarketEvent::OrderUpdated(maker.clone()));
                }
                events.push(MarketEvent::PositionUpdated(buyer));
                events.push(MarketEvent::PositionUpdated(seller));
            }

            events.insert(0, MarketEvent::OrderPlaced(order.clone()));
            events.push(self.book_updated(&state.book));

            (order, trades)
        };

        tracing::info!(
            order = %order.id,
            owner = %order.owner_id,
            side = ?order.side,
            qty = %order.quantity.as_decimal(),
            trades = trades.len(),
            "order placed"
        );
        self.events.publish_all(events);

        Ok((order, trades))
    }

    /// Cancel an order on behalf of its owner. Failure reports the
    /// order's true current status and never mutates anything.
    pub fn cancel_order(&self, order_id: OrderId, owner: &OwnerId) -> Result<Order, EngineError> {
        let (order, book_event) = {
            let mut state = self
                .state
                .write()
                .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
            let order = state.book.cancel_order(&order_id, owner)?;
            (order, self.book_updated(&state.book))
        };

        tracing::info!(order = %order.id, owner = %owner, "order cancelled");
        self.events
            .publish_all([MarketEvent::OrderCancelled(order.clone()), book_event]);

        Ok(order)
    }

    /// Resynchronize provider-backed asks from a registry snapshot.
    /// Online providers keep one ask at their live quote; offline and
    /// unknown providers have theirs removed.
    pub fn sync_provider_asks(&self, providers: &[Provider]) -> Result<(), EngineError> {
        let mut events = Vec::new();
        {
            let mut state = self
                .state
                .write()
                .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
            let mut changed = false;

            for provider in providers {
                if provider.status == ProviderStatus::Online && provider.price.is_positive() {
                    let next_id = self.next_order_id();
                    let size = quote_size();
                    match state
                        .book
                        .sync_provider_quote(&provider.id, provider.price, size, next_id)
                    {
                        QuoteSync::Unchanged(_) => {}
                        QuoteSync::Created(id) => {
                            changed = true;
                            if let Some(ask) = state.book.get_order(&id) {
                                events.push(MarketEvent::OrderPlaced(ask.clone()));
                            }
                            tracing::debug!(provider = %provider.id, order = %id, "provider ask created");
                        }
                        QuoteSync::Repriced(id) | QuoteSync::Replenished(id) => {
                            changed = true;
                            if let Some(ask) = state.book.get_order(&id) {
                                events.push(MarketEvent::OrderUpdated(ask.clone()));
                            }
                            tracing::debug!(provider = %provider.id, order = %id, "provider ask refreshed");
                        }
                    }
                } else if let Some(dropped) = state.book.drop_provider_quote(&provider.id) {
                    changed = true;
                    tracing::debug!(provider = %provider.id, order = %dropped.id, "provider ask dropped");
                    events.push(MarketEvent::OrderCancelled(dropped));
                }
            }

            if changed {
                events.push(self.book_updated(&state.book));
            }
        }
        self.events.publish_all(events);
        Ok(())
    }

    /// Orderbook snapshot, top `depth` levels per side
    pub fn depth(&self, depth: usize) -> Result<OrderBookSnapshot, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        Ok(state.book.snapshot(depth))
    }

    /// Best ask minus best bid; zero when either side is empty
    pub fn spread(&self) -> Result<Price, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        Ok(state.book.spread())
    }

    /// The last `limit` trades, oldest first
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<Trade>, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        let skip = state.trades.len().saturating_sub(limit);
        Ok(state.trades.iter().skip(skip).cloned().collect())
    }

    /// Look up any order by id, resting or terminal
    pub fn order(&self, order_id: OrderId) -> Result<Option<Order>, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        Ok(state.book.get_order(&order_id).cloned())
    }

    /// Position report for an owner: running totals plus their open and
    /// filled orders. Owners with no history read as zeroed.
    pub fn position(&self, owner: &OwnerId) -> Result<PositionReport, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;

        let orders = state.book.orders_for_owner(owner);
        let open_orders: Vec<Order> = orders.iter().filter(|o| o.is_active()).cloned().collect();
        let filled_orders: Vec<Order> = orders
            .iter()
            .filter(|o| o.status == OrderStatus::Filled)
            .cloned()
            .collect();

        Ok(PositionReport {
            position: state.positions.get_or_default(owner),
            open_orders,
            filled_orders,
        })
    }

    /// Every order an owner has placed, oldest first
    pub fn orders_for_owner(&self, owner: &OwnerId) -> Result<Vec<Order>, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        Ok(state.book.orders_for_owner(owner))
    }

    /// Aggregate book statistics
    pub fn stats(&self) -> Result<BookStats, EngineError> {
        let state = self
            .state
            .read()
            .map_err(|_| EngineError::Internal("lock poisoned".to_string()))?;
        Ok(BookStats {
            bid_orders: state.book.resting_orders(Side::Buy),
            ask_orders: state.book.resting_orders(Side::Sell),
            trade_count: state.trades_executed as usize,
            bid_volume: state.book.resting_volume(Side::Buy),
            ask_volume: state.book.resting_volume(Side::Sell),
            last_trade_price: state.trades.back().map(|t| t.price),
        })
    }

    fn book_updated(&self, book: &OrderBook) -> MarketEvent {
        MarketEvent::BookUpdated {
            sequence: book.sequence(),
            best_bid: book.best_bid(),
            best_ask: book.best_ask(),
            spread: book.spread(),
        }
    }
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new(EventHub::default())
    }
}

fn quote_size() -> Quantity {
    use rand::Rng;
    let tokens = QUOTE_SIZE_BASE + rand::thread_rng().gen_range(0..QUOTE_SIZE_JITTER);
    Quantity::new(Decimal::from(tokens))
}
