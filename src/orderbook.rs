//! Orderbook with price-time priority matching for the compute-token market
//!
//! The book holds user limit orders and one synthetic ask per online
//! provider. Terminal orders (filled, cancelled, market leftovers) move to
//! an archive so fill history stays queryable.

use crate::engine::EngineError;
use crate::order::{Order, OrderSource, OrderStatus, OrderType, Side};
use crate::types::{
    Fill, FillId, OrderBookSnapshot, OrderId, OwnerId, Price, PriceLevel, ProviderId, Quantity,
    Timestamp, Trade, TradeId,
};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// A single price level in the orderbook
#[derive(Debug, Default)]
struct Level {
    /// Orders at this price level, ordered by time (FIFO)
    orders: IndexMap<OrderId, Order>,
    /// Total remaining quantity at this level
    total_quantity: Quantity,
}

impl Level {
    fn new() -> Self {
        Self {
            orders: IndexMap::new(),
            total_quantity: Quantity::default(),
        }
    }

    fn add_order(&mut self, order: Order) {
        self.total_quantity += order.remaining_quantity;
        self.orders.insert(order.id, order);
    }

    fn remove_order(&mut self, order_id: &OrderId) -> Option<Order> {
        if let Some(order) = self.orders.shift_remove(order_id) {
            self.total_quantity -= order.remaining_quantity;
            Some(order)
        } else {
            None
        }
    }

    fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn order_count(&self) -> u32 {
        self.orders.len() as u32
    }
}

/// Outcome of resynchronizing one provider's quote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSync {
    /// A fresh ask was placed for the provider
    Created(OrderId),
    /// The resting ask moved to a new price
    Repriced(OrderId),
    /// A sold-out ask was topped up and put back on the book
    Replenished(OrderId),
    /// Quote already matches the book
    Unchanged(OrderId),
}

impl QuoteSync {
    pub fn order_id(&self) -> OrderId {
        match self {
            QuoteSync::Created(id)
            | QuoteSync::Repriced(id)
            | QuoteSync::Replenished(id)
            | QuoteSync::Unchanged(id) => *id,
        }
    }
}

/// The orderbook for the compute-token market
pub struct OrderBook {
    /// Bid levels (matched highest-first)
    bids: BTreeMap<Price, Level>,
    /// Ask levels (matched lowest-first)
    asks: BTreeMap<Price, Level>,
    /// Locator for resting orders
    locators: HashMap<OrderId, (Price, Side)>,
    /// Terminal and non-resting orders, kept for lookup and fill replay
    archive: HashMap<OrderId, Order>,
    /// Synthetic ask backing each provider
    provider_asks: HashMap<ProviderId, OrderId>,
    /// Sequence number for updates
    sequence: AtomicU64,
    /// Trade ID counter; trade ids are strictly increasing
    trade_counter: AtomicU64,
    /// Fill ID counter
    fill_counter: AtomicU64,
    /// Best bid price
    best_bid: Option<Price>,
    /// Best ask price
    best_ask: Option<Price>,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            locators: HashMap::new(),
            archive: HashMap::new(),
            provider_asks: HashMap::new(),
            sequence: AtomicU64::new(0),
            trade_counter: AtomicU64::new(1),
            fill_counter: AtomicU64::new(1),
            best_bid: None,
            best_ask: None,
        }
    }

    /// Monotonic update sequence
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Price> {
        self.best_bid
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Price> {
        self.best_ask
    }

    /// Spread between best ask and best bid. Zero when either side is
    /// empty.
    pub fn spread(&self) -> Price {
        match (self.best_ask, self.best_bid) {
            (Some(ask), Some(bid)) => Price::new(ask.as_decimal() - bid.as_decimal()),
            _ => Price::new(Decimal::ZERO),
        }
    }

    /// Count of resting orders on one side
    pub fn resting_orders(&self, side: Side) -> usize {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.values().map(|l| l.orders.len()).sum()
    }

    /// Total remaining quantity resting on one side
    pub fn resting_volume(&self, side: Side) -> Quantity {
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels
            .values()
            .fold(Quantity::default(), |acc, l| acc + l.total_quantity)
    }

    /// Place an order: match it synchronously, rest any limit remainder,
    /// archive everything else. Returns the taker's final state and the
    /// trades produced.
    pub fn place_order(&mut self, mut order: Order) -> (Order, Vec<Trade>) {
        let trades = self.match_order(&mut order);

        if order.is_active()
            && !order.remaining_quantity.is_zero()
            && order.order_type == OrderType::Limit
        {
            // Limit remainder rests; market remainder never does.
            self.add_order_to_book(order.clone());
        } else {
            self.archive.insert(order.id, order.clone());
        }

        self.update_best_prices();
        self.sequence.fetch_add(1, Ordering::SeqCst);

        (order, trades)
    }

    /// Match an incoming order against the book. The trade price is
    /// always the resting (maker) side's price; a limit taker stops at
    /// the first price that no longer satisfies its limit.
    fn match_order(&mut self, taker: &mut Order) -> Vec<Trade> {
        let mut trades = Vec::new();
        let mut completed: Vec<Order> = Vec::new();

        let book_side = match taker.side {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        };

        // Best-first price scan: asks ascending, bids descending
        let matching_prices: Vec<Price> = match taker.side {
            Side::Buy => book_side.keys().cloned().collect(),
            Side::Sell => book_side.keys().rev().cloned().collect(),
        };

        for price in matching_prices {
            if taker.remaining_quantity.is_zero() {
                break;
            }

            if let Some(limit_price) = taker.price {
                match taker.side {
                    Side::Buy if price > limit_price => break,
                    Side::Sell if price < limit_price => break,
                    _ => {}
                }
            }

            if let Some(level) = book_side.get_mut(&price) {
                let maker_ids: Vec<OrderId> = level.orders.keys().cloned().collect();

                for maker_id in maker_ids {
                    if taker.remaining_quantity.is_zero() {
                        break;
                    }

                    if let Some(maker) = level.orders.get_mut(&maker_id) {
                        let fill_qty =
                            std::cmp::min(taker.remaining_quantity, maker.remaining_quantity);
                        let now = Timestamp::now();

                        let (buy_order_id, sell_order_id, buyer, seller) = match taker.side {
                            Side::Buy => (
                                taker.id,
                                maker.id,
                                taker.owner_id.clone(),
                                maker.owner_id.clone(),
                            ),
                            Side::Sell => (
                                maker.id,
                                taker.id,
                                maker.owner_id.clone(),
                                taker.owner_id.clone(),
                            ),
                        };

                        let trade = Trade {
                            id: TradeId(self.trade_counter.fetch_add(1, Ordering::SeqCst)),
                            buy_order_id,
                            sell_order_id,
                            buyer,
                            seller,
                            price,
                            quantity: fill_qty,
                            timestamp: now,
                        };

                        taker.fill(Fill {
                            id: FillId(self.fill_counter.fetch_add(1, Ordering::SeqCst)),
                            order_id: taker.id,
                            price,
                            quantity: fill_qty,
                            counterparty: maker.owner_id.clone(),
                            timestamp: now,
                        });
                        maker.fill(Fill {
                            id: FillId(self.fill_counter.fetch_add(1, Ordering::SeqCst)),
                            order_id: maker.id,
                            price,
                            quantity: fill_qty,
                            counterparty: taker.owner_id.clone(),
                            timestamp: now,
                        });
                        level.total_quantity -= fill_qty;

                        trades.push(trade);
                    }
                }

                // Move fully filled makers out, preserving final state
                let done_ids: Vec<OrderId> = level
                    .orders
                    .iter()
                    .filter(|(_, o)| o.is_filled())
                    .map(|(id, _)| *id)
                    .collect();
                for id in done_ids {
                    if let Some(done) = level.orders.shift_remove(&id) {
                        completed.push(done);
                    }
                }
            }
        }

        // Remove empty price levels
        match taker.side {
            Side::Buy => self.asks.retain(|_, level| !level.is_empty()),
            Side::Sell => self.bids.retain(|_, level| !level.is_empty()),
        }

        for done in completed {
            self.locators.remove(&done.id);
            self.archive.insert(done.id, done);
        }

        trades
    }

    /// Add a limit order to the book at its price level
    fn add_order_to_book(&mut self, order: Order) {
        let price = match order.price {
            Some(p) => p,
            None => {
                tracing::error!(order = %order.id, "market order cannot rest on the book");
                debug_assert!(order.price.is_some(), "resting order must carry a price");
                return;
            }
        };
        let side = order.side;
        let order_id = order.id;

        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };

        levels.entry(price).or_insert_with(Level::new).add_order(order);
        self.locators.insert(order_id, (price, side));
    }

    /// Cancel an order on behalf of its owner. Fails with the order's
    /// true current state; never panics, never mutates on failure.
    pub fn cancel_order(&mut self, order_id: &OrderId, owner: &OwnerId) -> Result<Order, EngineError> {
        if let Some((price, side)) = self.locators.get(order_id).cloned() {
            let levels = match side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };

            let level = levels
                .get_mut(&price)
                .ok_or_else(|| EngineError::Internal("resting order missing its level".into()))?;
            let resting = level
                .orders
                .get(order_id)
                .ok_or_else(|| EngineError::Internal("locator points at empty level".into()))?;

            if resting.source == OrderSource::ProviderQuote {
                return Err(EngineError::ProviderQuoteImmutable(*order_id));
            }
            if &resting.owner_id != owner {
                return Err(EngineError::NotOrderOwner(*order_id));
            }

            let mut order = level
                .remove_order(order_id)
                .ok_or_else(|| EngineError::Internal("order vanished during cancel".into()))?;
            order.cancel();

            if level.is_empty() {
                levels.remove(&price);
            }
            self.locators.remove(order_id);
            self.archive.insert(order.id, order.clone());

            self.update_best_prices();
            self.sequence.fetch_add(1, Ordering::SeqCst);

            Ok(order)
        } else if let Some(order) = self.archive.get(order_id) {
            if &order.owner_id != owner {
                Err(EngineError::NotOrderOwner(*order_id))
            } else {
                // Already terminal; cancelling again is a no-op failure
                Err(EngineError::NotCancellable {
                    order_id: *order_id,
                    status: order.status,
                })
            }
        } else {
            Err(EngineError::OrderNotFound(*order_id))
        }
    }

    /// The synthetic ask currently backing a provider, if any
    pub fn provider_ask_id(&self, provider: &ProviderId) -> Option<OrderId> {
        self.provider_asks.get(provider).copied()
    }

    /// Resynchronize one online provider's quote. The existing ask is
    /// repriced in place so fills already taken against it stay intact;
    /// a sold-out ask is topped up (requested and remaining rise
    /// together) and put back on the book. `next_id` is consumed only
    /// when a fresh ask has to be created.
    pub fn sync_provider_quote(
        &mut self,
        provider: &ProviderId,
        price: Price,
        size: Quantity,
        next_id: OrderId,
    ) -> QuoteSync {
        if let Some(existing_id) = self.provider_asks.get(provider).copied() {
            if let Some((old_price, _)) = self.locators.get(&existing_id).cloned() {
                if old_price == price {
                    return QuoteSync::Unchanged(existing_id);
                }
                // Move the resting ask to its new level
                if let Some(level) = self.asks.get_mut(&old_price) {
                    if let Some(mut order) = level.remove_order(&existing_id) {
                        if level.is_empty() {
                            self.asks.remove(&old_price);
                        }
                        order.set_price(price);
                        self.locators.remove(&existing_id);
                        self.add_order_to_book(order);
                        self.update_best_prices();
                        self.sequence.fetch_add(1, Ordering::SeqCst);
                        return QuoteSync::Repriced(existing_id);
                    }
                }
                return QuoteSync::Unchanged(existing_id);
            }

            if let Some(archived) = self.archive.get(&existing_id) {
                if archived.status == OrderStatus::Filled {
                    // Sold out: top up and put back on the book
                    let mut order = match self.archive.remove(&existing_id) {
                        Some(o) => o,
                        None => return QuoteSync::Unchanged(existing_id),
                    };
                    order.replenish(size);
                    order.set_price(price);
                    self.add_order_to_book(order);
                    self.update_best_prices();
                    self.sequence.fetch_add(1, Ordering::SeqCst);
                    return QuoteSync::Replenished(existing_id);
                }
                // Cancelled quotes never resume; fall through to a new ask
            }
        }

        let order = Order::new_limit(
            next_id,
            OwnerId::from(provider),
            OrderSource::ProviderQuote,
            Side::Sell,
            price,
            size,
        );
        self.provider_asks.insert(provider.clone(), next_id);
        self.add_order_to_book(order);
        self.update_best_prices();
        self.sequence.fetch_add(1, Ordering::SeqCst);
        QuoteSync::Created(next_id)
    }

    /// Drop the ask backing a provider that went offline. Returns the
    /// cancelled order when one was still resting.
    pub fn drop_provider_quote(&mut self, provider: &ProviderId) -> Option<Order> {
        let order_id = self.provider_asks.remove(provider)?;
        let (price, _) = self.locators.get(&order_id).cloned()?;

        let level = self.asks.get_mut(&price)?;
        let mut order = level.remove_order(&order_id)?;
        order.cancel();

        if level.is_empty() {
            self.asks.remove(&price);
        }
        self.locators.remove(&order_id);
        self.archive.insert(order.id, order.clone());

        self.update_best_prices();
        self.sequence.fetch_add(1, Ordering::SeqCst);

        Some(order)
    }

    /// Update best bid/ask prices
    fn update_best_prices(&mut self) {
        self.best_bid = self.bids.keys().next_back().cloned();
        self.best_ask = self.asks.keys().next().cloned();
    }

    /// Get orderbook snapshot, top `depth` levels per side
    pub fn snapshot(&self, depth: usize) -> OrderBookSnapshot {
        let bids: Vec<PriceLevel> = self
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(price, level)| PriceLevel {
                price: *price,
                quantity: level.total_quantity,
                order_count: level.order_count(),
            })
            .collect();

        let asks: Vec<PriceLevel> = self
            .asks
            .iter()
            .take(depth)
            .map(|(price, level)| PriceLevel {
                price: *price,
                quantity: level.total_quantity,
                order_count: level.order_count(),
            })
            .collect();

        OrderBookSnapshot {
            bids,
            asks,
            spread: self.spread(),
            timestamp: Timestamp::now(),
            sequence: self.sequence.load(Ordering::SeqCst),
        }
    }

    /// Get an order by ID, resting or archived
    pub fn get_order(&self, order_id: &OrderId) -> Option<&Order> {
        if let Some((price, side)) = self.locators.get(order_id) {
            let levels = match side {
                Side::Buy => &self.bids,
                Side::Sell => &self.asks,
            };
            levels.get(price)?.orders.get(order_id)
        } else {
            self.archive.get(order_id)
        }
    }

    /// Every order belonging to an owner, oldest first
    pub fn orders_for_owner(&self, owner: &OwnerId) -> Vec<Order> {
        let mut out: Vec<Order> = Vec::new();
        for level in self.bids.values().chain(self.asks.values()) {
            for order in level.orders.values() {
                if &order.owner_id == owner {
                    out.push(order.clone());
                }
            }
        }
        for order in self.archive.values() {
            if &order.owner_id == owner {
                out.push(order.clone());
            }
        }
        out.sort_by_key(|o| (o.created_at, o.id.0));
        out
    }
}
