//! Order types and structures

use crate::types::{Fill, OrderId, OwnerId, Price, Quantity, Timestamp};
use serde::{Deserialize, Serialize};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Limit order - execute at specified price or better
    Limit,
    /// Market order - execute immediately at best available price
    Market,
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order is active in the book
    Open,
    /// Order is partially filled
    PartiallyFilled,
    /// Order is completely filled
    Filled,
    /// Order was cancelled
    Cancelled,
}

/// Where an order came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    /// Placed by a user account
    User,
    /// Synthetic ask backing an online provider's live quote
    ProviderQuote,
}

/// An order in the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique order identifier
    pub id: OrderId,
    /// Account that owns the order
    pub owner_id: OwnerId,
    /// User order or provider-backed quote
    pub source: OrderSource,
    /// Buy or Sell
    pub side: Side,
    /// Order type
    pub order_type: OrderType,
    /// Limit price (None for market orders)
    pub price: Option<Price>,
    /// Requested quantity
    pub quantity: Quantity,
    /// Quantity filled so far
    pub filled_quantity: Quantity,
    /// Remaining unfilled quantity
    pub remaining_quantity: Quantity,
    /// Current status
    pub status: OrderStatus,
    /// Fills taken against this order, append-only
    pub fills: Vec<Fill>,
    /// Order creation timestamp
    pub created_at: Timestamp,
    /// Last update timestamp
    pub updated_at: Timestamp,
}

impl Order {
    /// Create a new limit order
    pub fn new_limit(
        id: OrderId,
        owner_id: OwnerId,
        source: OrderSource,
        side: Side,
        price: Price,
        quantity: Quantity,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            owner_id,
            source,
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
            filled_quantity: Quantity::default(),
            remaining_quantity: quantity,
            status: OrderStatus::Open,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new market order
    pub fn new_market(id: OrderId, owner_id: OwnerId, side: Side, quantity: Quantity) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            owner_id,
            source: OrderSource::User,
            side,
            order_type: OrderType::Market,
            price: None,
            quantity,
            filled_quantity: Quantity::default(),
            remaining_quantity: quantity,
            status: OrderStatus::Open,
            fills: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if order is fully filled
    pub fn is_filled(&self) -> bool {
        self.remaining_quantity.is_zero()
    }

    /// Check if order can still be matched (not cancelled, not filled)
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// Apply a fill. The fill quantity must not exceed the remaining
    /// quantity; a violation is a matching bug, logged loudly and never
    /// clamped.
    pub fn fill(&mut self, fill: Fill) {
        if fill.quantity > self.remaining_quantity {
            tracing::error!(
                order = %self.id,
                fill_qty = %fill.quantity.as_decimal(),
                remaining = %self.remaining_quantity.as_decimal(),
                "fill exceeds remaining quantity"
            );
            debug_assert!(
                fill.quantity <= self.remaining_quantity,
                "fill exceeds remaining quantity"
            );
        }
        self.filled_quantity += fill.quantity;
        self.remaining_quantity -= fill.quantity;
        self.updated_at = fill.timestamp;
        self.fills.push(fill);
        self.status = if self.remaining_quantity.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.check_conserved();
    }

    /// Cancel the order. A cancelled order never resumes matching.
    pub fn cancel(&mut self) {
        self.status = OrderStatus::Cancelled;
        self.updated_at = Timestamp::now();
    }

    /// Raise requested and remaining quantity together. Used to
    /// resynchronize provider quotes whose liquidity ran dry; raising
    /// both sides keeps fill accounting intact.
    pub fn replenish(&mut self, qty: Quantity) {
        debug_assert!(
            self.status != OrderStatus::Cancelled,
            "cancelled orders never resume"
        );
        self.quantity += qty;
        self.remaining_quantity += qty;
        self.status = if self.filled_quantity.is_zero() {
            OrderStatus::Open
        } else {
            OrderStatus::PartiallyFilled
        };
        self.updated_at = Timestamp::now();
        self.check_conserved();
    }

    /// Update the limit price in place (provider quote resync).
    pub fn set_price(&mut self, price: Price) {
        self.price = Some(price);
        self.updated_at = Timestamp::now();
    }

    fn check_conserved(&self) {
        let conserved = self.filled_quantity + self.remaining_quantity == self.quantity;
        if !conserved {
            tracing::error!(
                order = %self.id,
                filled = %self.filled_quantity.as_decimal(),
                remaining = %self.remaining_quantity.as_decimal(),
                requested = %self.quantity.as_decimal(),
                "order quantity accounting out of balance"
            );
            debug_assert!(conserved, "filled + remaining must equal requested");
        }
    }
}

/// Request to place a new order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub owner_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
}

/// Request to cancel an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub owner_id: String,
}
