//! Venue-agnostic traits at the execution seams.
//!
//! The executor, reconciler, rebalancer, and validator talk to both venues
//! exclusively through these traits, so the synchronization core can be
//! exercised against in-memory doubles.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use super::hyperliquid::{ClearinghouseState, MasterOpenOrder};
use super::types::{NewOrder, OpenOrder, OrderResponse, OrderSide, OrderStatus, PositionRisk};

/// Order placement and account access on the Follower venue.
#[async_trait]
pub trait FollowerExchange: Send + Sync {
    /// Submit an order. Limit orders carry a tick-snapped price.
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse>;

    /// Cancel an order. An unknown-order response from the venue counts as
    /// success: the order is gone either way.
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    /// Atomically replace price and quantity of a resting limit order.
    async fn modify_order(
        &self,
        symbol: &str,
        order_id: i64,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse>;

    /// Current status of an order, `None` when the venue no longer knows it.
    async fn query_order(&self, symbol: &str, order_id: i64) -> Result<Option<OrderStatus>>;

    /// All resting orders for a symbol.
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    /// Signed position for a symbol; a flat position reads as zero amount.
    async fn position(&self, symbol: &str) -> Result<PositionRisk>;

    /// Total futures margin balance, used for equal-mode sizing.
    async fn total_margin_balance(&self) -> Result<Decimal>;

    /// Assert net-position (one-way) mode on the account.
    async fn set_one_way_mode(&self) -> Result<()>;
}

/// Snapshot access to the Master venue.
#[async_trait]
pub trait MasterData: Send + Sync {
    /// The Master account's currently resting orders.
    async fn open_orders(&self, user: &str) -> Result<Vec<MasterOpenOrder>>;

    /// Account state: margin summary and signed positions.
    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState>;
}
