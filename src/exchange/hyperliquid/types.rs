//! Type definitions for Master venue API payloads and stream events.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::types::OrderSide;

/// Request body for the Master venue info endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InfoRequest {
    /// Open orders for an account.
    OpenOrders { user: String },
    /// Account state: margin summary and signed asset positions.
    ClearinghouseState { user: String },
}

/// Book side in the Master venue's encoding: `B` bids, `A` asks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterSide {
    #[serde(rename = "B")]
    Bid,
    #[serde(rename = "A")]
    Ask,
}

impl MasterSide {
    pub fn to_order_side(self) -> OrderSide {
        match self {
            Self::Bid => OrderSide::Buy,
            Self::Ask => OrderSide::Sell,
        }
    }
}

/// A resting order as reported by the snapshot endpoint and order updates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterOpenOrder {
    pub coin: String,
    pub side: MasterSide,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub limit_px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub sz: Decimal,
    pub oid: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub reduce_only: bool,
}

/// Account state returned by the clearinghouse endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    pub margin_summary: MarginSummary,
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
}

impl ClearinghouseState {
    /// Signed position size for a coin; absent positions read as zero.
    pub fn signed_position(&self, coin: &str) -> Decimal {
        self.asset_positions
            .iter()
            .find(|p| p.position.coin == coin)
            .map(|p| p.position.szi)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub account_value: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetPosition {
    pub position: PerpPosition,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpPosition {
    pub coin: String,
    /// Signed size: positive long, negative short
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub szi: Decimal,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option")]
    pub entry_px: Option<Decimal>,
}

// ==================== Stream payloads ====================

/// Subscription request sent after the stream opens.
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest {
    pub method: &'static str,
    pub subscription: Subscription,
}

impl SubscribeRequest {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            method: "subscribe",
            subscription,
        }
    }
}

/// Stream channels consumed from the Master venue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Subscription {
    OrderUpdates { user: String },
    UserFills { user: String },
}

/// Application-level ping; the server does not push heartbeats.
#[derive(Debug, Clone, Serialize)]
pub struct PingRequest {
    pub method: &'static str,
}

impl Default for PingRequest {
    fn default() -> Self {
        Self { method: "ping" }
    }
}

/// Envelope for every incoming stream message.
#[derive(Debug, Clone, Deserialize)]
pub struct WsMessage {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One entry of an order-updates batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsOrderUpdate {
    pub order: MasterOpenOrder,
    pub status: String,
    #[serde(default)]
    pub user: Option<String>,
}

/// A user-fills message; the first one after subscribing is a snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsUserFills {
    #[serde(default)]
    pub is_snapshot: bool,
    pub user: String,
    pub fills: Vec<WsFill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsFill {
    pub coin: String,
    pub side: MasterSide,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub sz: Decimal,
    pub time: i64,
    /// Whether the tracked user was the taker of this trade
    #[serde(default)]
    pub crossed: bool,
}

// ==================== Domain events ====================

/// Lifecycle status of a Master order event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterOrderStatus {
    Open,
    Canceled,
    Filled,
    /// A conditional order became active; handled like `Open`
    Triggered,
}

impl MasterOrderStatus {
    /// Map the venue's status string; unknown statuses are dropped upstream.
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "open" => Some(Self::Open),
            "canceled" | "marginCanceled" => Some(Self::Canceled),
            "filled" => Some(Self::Filled),
            "triggered" => Some(Self::Triggered),
            _ => None,
        }
    }
}

/// A classified Master order lifecycle event.
#[derive(Debug, Clone)]
pub struct MasterOrderEvent {
    pub oid: u64,
    pub coin: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub status: MasterOrderStatus,
    pub reduce_only: bool,
    pub timestamp: i64,
    pub account: String,
}

/// A taker fill executed by the Master account.
#[derive(Debug, Clone)]
pub struct MasterFillEvent {
    pub coin: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub time: i64,
}

impl MasterFillEvent {
    /// Synthetic journal id; fills carry no oid of their own.
    pub fn event_id(&self) -> String {
        format!("fill:{}:{}:{}", self.coin, self.time, self.size)
    }
}

/// Everything the ingest layer hands to the executor.
#[derive(Debug, Clone)]
pub enum MasterEvent {
    Order(MasterOrderEvent),
    Fill(MasterFillEvent),
}

// Custom deserializers for the venue's string-encoded decimals

fn deserialize_decimal_str<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse::<Decimal>().map_err(serde::de::Error::custom)
}

fn deserialize_decimal_str_option<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<Option<String>> = Option::deserialize(deserializer)?;
    match opt {
        Some(Some(s)) if !s.is_empty() => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_info_request_serialization() {
        let req = InfoRequest::OpenOrders {
            user: "0xabc".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"openOrders","user":"0xabc"}"#);

        let req = InfoRequest::ClearinghouseState {
            user: "0xabc".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"clearinghouseState""#));
    }

    #[test]
    fn test_subscribe_request_serialization() {
        let req = SubscribeRequest::new(Subscription::OrderUpdates {
            user: "0xabc".to_string(),
        });
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"method":"subscribe","subscription":{"type":"orderUpdates","user":"0xabc"}}"#
        );
    }

    #[test]
    fn test_deserialize_open_order() {
        let json = r#"{
            "coin": "BTC",
            "side": "B",
            "limitPx": "30000.0",
            "sz": "0.02",
            "oid": 91490942,
            "timestamp": 1700000000000,
            "reduceOnly": false
        }"#;
        let order: MasterOpenOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.side.to_order_side(), OrderSide::Buy);
        assert_eq!(order.limit_px, dec!(30000.0));
        assert_eq!(order.sz, dec!(0.02));
    }

    #[test]
    fn test_deserialize_clearinghouse_state() {
        let json = r#"{
            "marginSummary": {"accountValue": "125000.5"},
            "assetPositions": [
                {"position": {"coin": "BTC", "szi": "-0.5", "entryPx": "29000.0"}},
                {"position": {"coin": "ETH", "szi": "2.0", "entryPx": null}}
            ]
        }"#;
        let state: ClearinghouseState = serde_json::from_str(json).unwrap();
        assert_eq!(state.margin_summary.account_value, dec!(125000.5));
        assert_eq!(state.signed_position("BTC"), dec!(-0.5));
        assert_eq!(state.signed_position("ETH"), dec!(2.0));
        assert_eq!(state.signed_position("SOL"), Decimal::ZERO);
    }

    #[test]
    fn test_master_status_parsing() {
        assert_eq!(MasterOrderStatus::parse("open"), Some(MasterOrderStatus::Open));
        assert_eq!(
            MasterOrderStatus::parse("marginCanceled"),
            Some(MasterOrderStatus::Canceled)
        );
        assert_eq!(
            MasterOrderStatus::parse("triggered"),
            Some(MasterOrderStatus::Triggered)
        );
        assert_eq!(MasterOrderStatus::parse("liquidated"), None);
    }

    #[test]
    fn test_fill_event_id() {
        let fill = MasterFillEvent {
            coin: "BTC".to_string(),
            side: OrderSide::Buy,
            price: dec!(30000),
            size: dec!(0.02),
            time: 1700000000000,
        };
        assert_eq!(fill.event_id(), "fill:BTC:1700000000000:0.02");
    }
}
