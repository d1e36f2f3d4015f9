//! Compute DEX - Trading Core
//!
//! A price-time priority orderbook for compute tokens, paired with a
//! provider registry, health monitoring, selection policies and a
//! retrying inference router with cloud fallback.

pub mod orderbook;
pub mod order;
pub mod engine;
pub mod position;
pub mod events;
pub mod types;
pub mod provider;
pub mod monitor;
pub mod selector;
pub mod router;
pub mod config;
pub mod api;

pub use orderbook::OrderBook;
pub use order::{Order, OrderSource, OrderStatus, OrderType, Side};
pub use engine::{EngineError, MatchingEngine};
pub use position::{Position, PositionLedger, PositionReport};
pub use events::{EventHub, MarketEvent};
pub use types::*;
pub use provider::{Provider, ProviderDescriptor, ProviderRegistry, ProviderStatus};
pub use monitor::{HealthProbe, HttpProbe, ProviderMonitor};
pub use selector::{ProviderSelector, SelectionOptions, SelectionStrategy};
pub use router::{
    ChatMessage, ClusterRouter, HttpInferenceTransport, InferenceRequest, InferenceResponse,
    InferenceTransport, RouterConfig, RouterError,
};
pub use config::CoreConfig;
