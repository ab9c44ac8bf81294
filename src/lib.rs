//! Helmsman - autonomous crypto trading platform built in Rust
//!
//! Two cooperating services share this crate:
//! - the execution engine: a soft-real-time control loop that enforces a
//!   declarative strategy document against live positions under hard
//!   portfolio risk limits
//! - the agent runner: a restart-safe learning loop that drives five
//!   LLM agents through a fixed pipeline and produces the next strategy
//!   document
//!
//! The hinge between them is the strategy document: the runner writes it
//! atomically, the execution engine hot-reloads it via file watch.

pub mod agents;
pub mod api_server;
pub mod config;
pub mod dsl;
pub mod events;
pub mod exchange;
pub mod execution;
pub mod market_data;
pub mod models;
pub mod strategy;
pub mod utils;

// Re-export commonly used types
pub use config::AppConfig;
pub use models::{TradingError, TradingResult};

pub use events::{Event, EventLog, EventType};
pub use exchange::ExchangeAdapter;
pub use execution::{OrderRouter, PositionRegistry};
pub use market_data::MarketDataHub;
pub use strategy::{StrategyDocument, StrategyService};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
