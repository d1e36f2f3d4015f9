//! Market event stream
//!
//! Events are published on a bounded broadcast channel after the engine
//! commits a mutation and releases its write lock. A slow subscriber lags
//! and skips; it never blocks or reorders the writer.

use crate::order::Order;
use crate::position::Position;
use crate::types::{Price, Trade};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the matching engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MarketEvent {
    #[serde(rename = "order_placed")]
    OrderPlaced(Order),
    /// A resting order changed: a maker got filled against, or a
    /// provider ask was repriced or replenished
    #[serde(rename = "order_updated")]
    OrderUpdated(Order),
    #[serde(rename = "order_cancelled")]
    OrderCancelled(Order),
    #[serde(rename = "trade_executed")]
    TradeExecuted(Trade),
    #[serde(rename = "position_updated")]
    PositionUpdated(Position),
    #[serde(rename = "book_updated")]
    BookUpdated {
        sequence: u64,
        best_bid: Option<Price>,
        best_ask: Option<Price>,
        spread: Price,
    },
}

/// Fan-out hub for market events
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<MarketEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.tx.subscribe()
    }

    /// Send one event. Having no subscribers is not an error.
    pub fn publish(&self, event: MarketEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = MarketEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
