//! Per-owner position tracking
//!
//! Positions are an incremental cache over fill history: replaying an
//! owner's fills from empty must reproduce the live record exactly.

use crate::order::{Order, Side};
use crate::types::{OwnerId, Price, Quantity};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Notional value of a fill. Prices are quoted per 1,000 tokens.
pub fn notional(price: Price, qty: Quantity) -> Decimal {
    price.as_decimal() * qty.as_decimal() / Decimal::ONE_THOUSAND
}

/// Running totals for one owner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub owner_id: OwnerId,
    /// Total tokens traded, both sides
    pub total_volume: Quantity,
    /// Currency paid out on buys
    pub total_spent: Decimal,
    /// Currency taken in on sells
    pub total_received: Decimal,
    /// received - spent
    pub net_pnl: Decimal,
    pub trade_count: u64,
}

impl Position {
    pub fn new(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            total_volume: Quantity::default(),
            total_spent: Decimal::ZERO,
            total_received: Decimal::ZERO,
            net_pnl: Decimal::ZERO,
            trade_count: 0,
        }
    }

    fn apply(&mut self, side: Side, price: Price, qty: Quantity) {
        self.total_volume += qty;
        self.trade_count += 1;
        let value = notional(price, qty);
        match side {
            Side::Buy => self.total_spent += value,
            Side::Sell => self.total_received += value,
        }
        self.net_pnl = self.total_received - self.total_spent;
    }
}

/// Position query result: running totals plus the owner's current orders
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReport {
    pub position: Position,
    pub open_orders: Vec<Order>,
    pub filled_orders: Vec<Order>,
}

/// Live position cache, updated once per fill
#[derive(Debug, Default)]
pub struct PositionLedger {
    positions: HashMap<OwnerId, Position>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one side of a trade and return the updated position.
    pub fn apply(&mut self, owner: &OwnerId, side: Side, price: Price, qty: Quantity) -> Position {
        let position = self
            .positions
            .entry(owner.clone())
            .or_insert_with(|| Position::new(owner.clone()));
        position.apply(side, price, qty);
        position.clone()
    }

    /// Current position, zeroed when the owner has never traded.
    pub fn get_or_default(&self, owner: &OwnerId) -> Position {
        self.positions
            .get(owner)
            .cloned()
            .unwrap_or_else(|| Position::new(owner.clone()))
    }

    /// Rebuild one owner's position by replaying their order fills from
    /// empty. Used to audit the live cache.
    pub fn replay<'a>(owner: &OwnerId, orders: impl IntoIterator<Item = &'a Order>) -> Position {
        let mut position = Position::new(owner.clone());
        let mut fills: Vec<(&'a Order, usize)> = Vec::new();
        for order in orders {
            if &order.owner_id != owner {
                continue;
            }
            for (idx, _) in order.fills.iter().enumerate() {
                fills.push((order, idx));
            }
        }
        // Fill ids are allocated in execution order
        fills.sort_by_key(|(order, idx)| order.fills[*idx].id.0);
        for (order, idx) in fills {
            let fill = &order.fills[idx];
            position.apply(order.side, fill.price, fill.quantity);
        }
        position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderSource;
    use crate::types::{Fill, FillId, OrderId, Timestamp};
    use rust_decimal_macros::dec;

    #[test]
    fn test_buy_and_sell_accounting() {
        let mut ledger = PositionLedger::new();
        let alice = OwnerId::new("alice");

        // Buy 600 tokens at 0.002 per 1k: spends 0.0012
        let p = ledger.apply(&alice, Side::Buy, Price::new(dec!(0.002)), Quantity::new(dec!(600)));
        assert_eq!(p.total_spent, dec!(0.0012));
        assert_eq!(p.total_volume.as_decimal(), dec!(600));
        assert_eq!(p.net_pnl, dec!(-0.0012));

        // Sell 600 back at 0.003 per 1k: receives 0.0018
        let p = ledger.apply(&alice, Side::Sell, Price::new(dec!(0.003)), Quantity::new(dec!(600)));
        assert_eq!(p.total_received, dec!(0.0018));
        assert_eq!(p.net_pnl, dec!(0.0006));
        assert_eq!(p.trade_count, 2);
    }

    #[test]
    fn test_unknown_owner_reads_zeroed() {
        let ledger = PositionLedger::new();
        let p = ledger.get_or_default(&OwnerId::new("nobody"));
        assert_eq!(p.trade_count, 0);
        assert_eq!(p.net_pnl, dec!(0));
        assert!(p.total_volume.is_zero());
    }

    #[test]
    fn test_replay_matches_live_cache() {
        let alice = OwnerId::new("alice");
        let mut ledger = PositionLedger::new();

        let mut order = Order::new_limit(
            OrderId(1),
            alice.clone(),
            OrderSource::User,
            Side::Buy,
            Price::new(dec!(0.002)),
            Quantity::new(dec!(1000)),
        );
        for (i, qty) in [dec!(600), dec!(400)].into_iter().enumerate() {
            let fill = Fill {
                id: FillId(i as u64 + 1),
                order_id: order.id,
                price: Price::new(dec!(0.002)),
                quantity: Quantity::new(qty),
                counterparty: OwnerId::new("bob"),
                timestamp: Timestamp::now(),
            };
            ledger.apply(&alice, order.side, fill.price, fill.quantity);
            order.fill(fill);
        }

        let live = ledger.get_or_default(&alice);
        let replayed = PositionLedger::replay(&alice, [&order]);
        assert_eq!(replayed.total_spent, live.total_spent);
        assert_eq!(replayed.total_received, live.total_received);
        assert_eq!(replayed.total_volume, live.total_volume);
        assert_eq!(replayed.trade_count, live.trade_count);
        assert_eq!(replayed.net_pnl, live.net_pnl);
    }
}
