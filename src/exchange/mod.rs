//! Venue integrations.
//!
//! ## Follower (Binance USD-M futures)
//! Authenticated REST for order placement, cancel, cancel-replace, open
//! orders, position risk, and account info, plus the signed user-data
//! stream delivering execution reports. The account is held in one-way
//! position mode.
//!
//! ## Master (Hyperliquid)
//! Read-only info endpoint for open-order and account snapshots, plus the
//! orderUpdates / userFills subscriptions that drive the executor.

mod client;
pub mod hyperliquid;
pub mod mock;
mod traits;
mod types;
mod websocket;

pub use client::BinanceClient;
pub use hyperliquid::HyperliquidClient;
pub use traits::{FollowerExchange, MasterData};
pub use types::*;
pub use websocket::{parse_execution_report, FollowerUserStream};
