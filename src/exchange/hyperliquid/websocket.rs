//! Master venue stream ingest.
//!
//! Maintains the orderUpdates and userFills subscriptions for every followed
//! account, classifies raw frames into [`MasterEvent`]s, and keeps the
//! connection alive: the server pushes no heartbeats, so the client pings
//! every 30 s and treats a silent minute as a dead connection. Reconnects
//! use exponential backoff (base 1 s, cap 30 s) and every successful open is
//! announced so the snapshot-reconcile pass can repair the gap.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::types::{
    MasterEvent, MasterFillEvent, MasterOrderEvent, MasterOrderStatus, PingRequest,
    SubscribeRequest, Subscription, WsMessage, WsOrderUpdate, WsUserFills,
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A connection with no inbound traffic for this long is considered dead.
const SILENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Master venue WebSocket ingest task.
pub struct MasterWebSocket {
    ws_url: String,
    users: Vec<String>,
}

enum ConnectionEnd {
    Shutdown,
    Lost,
}

impl MasterWebSocket {
    pub fn new(ws_url: String, users: Vec<String>) -> Self {
        Self { ws_url, users }
    }

    /// Run until shutdown, reconnecting on any stream failure.
    pub async fn run(
        &self,
        events: mpsc::Sender<MasterEvent>,
        connected: mpsc::Sender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .connect_once(&events, &connected, &mut shutdown, &mut attempt)
                .await
            {
                Ok(ConnectionEnd::Shutdown) => break,
                Ok(ConnectionEnd::Lost) => warn!("Master stream closed, reconnecting"),
                Err(e) => warn!(error = %e, "Master stream error, reconnecting"),
            }

            attempt += 1;
            let backoff = Duration::from_secs((1u64 << (attempt - 1).min(5)).min(30));
            debug!(attempt, ?backoff, "Backing off before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Master stream ingest stopped");
    }

    async fn connect_once(
        &self,
        events: &mpsc::Sender<MasterEvent>,
        connected: &mpsc::Sender<()>,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<ConnectionEnd> {
        let (ws_stream, _) = connect_async(&self.ws_url)
            .await
            .context("Failed to connect to Master stream")?;
        let (mut write, mut read) = ws_stream.split();

        for user in &self.users {
            for subscription in [
                Subscription::OrderUpdates { user: user.clone() },
                Subscription::UserFills { user: user.clone() },
            ] {
                let request = serde_json::to_string(&SubscribeRequest::new(subscription))?;
                write
                    .send(Message::Text(request))
                    .await
                    .context("Failed to send subscription")?;
            }
        }

        info!(users = self.users.len(), "Master stream connected");
        *attempt = 0;
        let _ = connected.send(()).await;

        let mut ping = interval(PING_INTERVAL);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(ConnectionEnd::Shutdown);
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() > SILENCE_TIMEOUT {
                        anyhow::bail!("No traffic for {SILENCE_TIMEOUT:?}, closing connection");
                    }
                    let ping_msg = serde_json::to_string(&PingRequest::default())?;
                    write
                        .send(Message::Text(ping_msg))
                        .await
                        .context("Failed to send ping")?;
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            for event in parse_events(&text) {
                                if events.send(event).await.is_err() {
                                    warn!("Event receiver dropped");
                                    return Ok(ConnectionEnd::Shutdown);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(ConnectionEnd::Lost),
                        Some(Err(e)) => return Err(e).context("Master stream read error"),
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Classify one raw frame into executor events.
///
/// Order updates pass through with their status mapped; fills are forwarded
/// only when the tracked user was the taker (`crossed`), since maker fills
/// are already implied by a mirrored resting order. Snapshot fill batches
/// are history and never re-executed.
pub fn parse_events(text: &str) -> Vec<MasterEvent> {
    let Ok(message) = serde_json::from_str::<WsMessage>(text) else {
        debug!("Unparseable stream frame");
        return Vec::new();
    };

    match message.channel.as_str() {
        "orderUpdates" => serde_json::from_value::<Vec<WsOrderUpdate>>(message.data)
            .map(|updates| updates.into_iter().filter_map(order_event).collect())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Malformed orderUpdates frame");
                Vec::new()
            }),
        "userFills" => serde_json::from_value::<WsUserFills>(message.data)
            .map(fill_events)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Malformed userFills frame");
                Vec::new()
            }),
        "pong" | "subscriptionResponse" => Vec::new(),
        other => {
            debug!(channel = other, "Ignoring stream channel");
            Vec::new()
        }
    }
}

fn order_event(update: WsOrderUpdate) -> Option<MasterEvent> {
    let Some(status) = MasterOrderStatus::parse(&update.status) else {
        debug!(oid = update.order.oid, status = %update.status, "Ignoring order status");
        return None;
    };
    Some(MasterEvent::Order(MasterOrderEvent {
        oid: update.order.oid,
        coin: update.order.coin,
        side: update.order.side.to_order_side(),
        price: update.order.limit_px,
        size: update.order.sz,
        status,
        reduce_only: update.order.reduce_only,
        timestamp: update.order.timestamp,
        account: update.user.unwrap_or_default(),
    }))
}

fn fill_events(fills: WsUserFills) -> Vec<MasterEvent> {
    if fills.is_snapshot {
        return Vec::new();
    }
    fills
        .fills
        .into_iter()
        .filter(|f| f.crossed)
        .map(|f| {
            MasterEvent::Fill(MasterFillEvent {
                coin: f.coin,
                side: f.side.to_order_side(),
                price: f.px,
                size: f.sz,
                time: f.time,
            })
        })
        .collect()
}
