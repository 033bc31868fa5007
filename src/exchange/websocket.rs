//! Follower venue user-data stream.
//!
//! Delivers execution reports for the mirror account. The stream is keyed by
//! a listen key obtained over REST; the key is kept alive every 30 minutes
//! and re-created whenever the connection drops.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::client::BinanceClient;
use super::types::{ExecutionReport, OrderSide, OrderStatus};

const FUTURES_WS_URL: &str = "wss://fstream.binance.com";
const FUTURES_TESTNET_WS_URL: &str = "wss://stream.binancefuture.com";

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Raw order-update event from the user-data stream.
#[derive(Debug, Clone, Deserialize)]
struct UserStreamEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "o", default)]
    order: Option<OrderUpdateData>,
}

#[derive(Debug, Clone, Deserialize)]
struct OrderUpdateData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "l")]
    last_filled_qty: String,
    #[serde(rename = "L")]
    last_filled_price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Follower venue user-data stream task.
pub struct FollowerUserStream {
    base_url: String,
    client: Arc<BinanceClient>,
}

impl FollowerUserStream {
    pub fn new(testnet: bool, client: Arc<BinanceClient>) -> Self {
        let base_url = if testnet {
            FUTURES_TESTNET_WS_URL.to_string()
        } else {
            FUTURES_WS_URL.to_string()
        };
        Self { base_url, client }
    }

    /// Run until shutdown, re-keying and reconnecting on any failure.
    pub async fn run(
        &self,
        reports: mpsc::Sender<ExecutionReport>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let listen_key = match self.client.create_listen_key().await {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Failed to create listen key, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                        _ = shutdown.changed() => continue,
                    }
                }
            };

            if let Err(e) = self
                .stream_once(&listen_key, &reports, &mut shutdown)
                .await
            {
                warn!(error = %e, "Follower stream error, reconnecting");
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Follower stream ingest stopped");
    }

    async fn stream_once(
        &self,
        listen_key: &str,
        reports: &mpsc::Sender<ExecutionReport>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let url = format!("{}/ws/{}", self.base_url, listen_key);
        let (ws_stream, _) = connect_async(&url).await?;
        let (_write, mut read) = ws_stream.split();
        info!("Follower stream connected");

        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = self.client.keepalive_listen_key().await {
                        warn!(error = %e, "Listen key keepalive failed");
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(report) = parse_execution_report(&text) {
                                if reports.send(report).await.is_err() {
                                    warn!("Report receiver dropped");
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_))) => {
                            debug!("Received ping");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            anyhow::bail!("Follower stream closed by server");
                        }
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Parse a raw user-stream frame into an execution report.
///
/// Only `ORDER_TRADE_UPDATE` events are relevant; account updates and other
/// event types are dropped.
pub fn parse_execution_report(text: &str) -> Option<ExecutionReport> {
    let event: UserStreamEvent = serde_json::from_str(text).ok()?;
    if event.event_type != "ORDER_TRADE_UPDATE" {
        return None;
    }
    let order = event.order?;

    let side = match order.side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => {
            warn!(side = other, "Unknown side in execution report");
            return None;
        }
    };
    let status = match order.status.as_str() {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        "EXPIRED_IN_MATCH" => OrderStatus::ExpiredInMatch,
        other => {
            warn!(status = other, "Unknown status in execution report");
            return None;
        }
    };

    Some(ExecutionReport {
        order_id: order.order_id,
        symbol: order.symbol,
        side,
        status,
        last_fill_qty: Decimal::from_str(&order.last_filled_qty).unwrap_or(Decimal::ZERO),
        last_fill_price: Decimal::from_str(&order.last_filled_price).unwrap_or(Decimal::ZERO),
        timestamp: order.trade_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_order_trade_update() {
        let frame = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 1700000000100,
            "o": {
                "s": "BTCUSDT",
                "i": 987654,
                "S": "BUY",
                "X": "FILLED",
                "l": "0.002",
                "L": "30000.0",
                "T": 1700000000099
            }
        }"#;
        let report = parse_execution_report(frame).unwrap();
        assert_eq!(report.order_id, 987654);
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(report.last_fill_qty, dec!(0.002));
        assert_eq!(report.last_fill_price, dec!(30000.0));
    }

    #[test]
    fn test_other_events_dropped() {
        let frame = r#"{"e": "ACCOUNT_UPDATE", "E": 1700000000100}"#;
        assert!(parse_execution_report(frame).is_none());
        assert!(parse_execution_report("not json").is_none());
    }
}
