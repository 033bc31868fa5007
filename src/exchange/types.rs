//! Type definitions for Follower venue API payloads.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn is_buy(self) -> bool {
        matches!(self, Self::Buy)
    }

    /// Side that reduces a signed position.
    pub fn closing(signed_position: Decimal) -> Self {
        if signed_position > Decimal::ZERO {
            Self::Sell
        } else {
            Self::Buy
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
    Gtx, // Post Only (Good Till Crossing)
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Whether the order can no longer trade.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::New | Self::PartiallyFilled)
    }
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Already snapped to the symbol tick; rendered verbatim
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    pub new_client_order_id: Option<String>,
}

impl NewOrder {
    /// Good-till-canceled limit order.
    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            reduce_only: false,
            new_client_order_id: None,
        }
    }

    /// Market order.
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            reduce_only: false,
            new_client_order_id: None,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Order response from the Follower venue.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    pub side: OrderSide,
    pub update_time: i64,
}

/// A resting order from the open-orders endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(default)]
    pub reduce_only: bool,
    pub time: i64,
}

impl OpenOrder {
    /// Quantity still resting on the book.
    pub fn remaining_qty(&self) -> Decimal {
        self.orig_qty - self.executed_qty
    }
}

/// Futures position risk entry: signed amount, entry, mark, liquidation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_price: Decimal,
}

/// Futures account summary.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    #[serde(with = "rust_decimal::serde::str")]
    pub total_margin_balance: Decimal,
}

/// Listen key for the signed user-data stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenKey {
    pub listen_key: String,
}

/// Error body returned by the Follower venue.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Venue error code: order not found on cancel.
pub const ERR_UNKNOWN_ORDER: i64 = -2011;
/// Venue error code: order does not exist on query.
pub const ERR_ORDER_DOES_NOT_EXIST: i64 = -2013;
/// Venue error code: invalid key, IP, or permissions.
pub const ERR_REJECTED_MBX_KEY: i64 = -2015;
/// Venue error code: position mode already matches the requested one.
pub const ERR_NO_NEED_TO_CHANGE_POSITION_SIDE: i64 = -4059;

/// Execution report delivered on the user-data stream.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub last_fill_qty: Decimal,
    pub last_fill_price: Decimal,
    pub timestamp: i64,
}

/// Map a Master instrument to its Follower perpetual symbol.
pub fn futures_symbol(coin: &str) -> String {
    format!("{coin}USDT")
}
