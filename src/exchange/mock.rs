//! In-memory venue doubles for exercising the synchronization core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;

use super::hyperliquid::{
    AssetPosition, ClearinghouseState, MarginSummary, MasterOpenOrder, MasterSide, PerpPosition,
};
use super::traits::{FollowerExchange, MasterData};
use super::types::{
    NewOrder, OpenOrder, OrderResponse, OrderSide, OrderStatus, OrderType, PositionRisk,
};

#[derive(Debug, Default)]
struct MockFollowerState {
    /// symbol -> (signed amount, entry price)
    positions: HashMap<String, (Decimal, Decimal)>,
    open_orders: HashMap<i64, OpenOrder>,
    /// Statuses of orders no longer resting, for `query_order`
    statuses: HashMap<i64, OrderStatus>,
    placed: Vec<NewOrder>,
    canceled: Vec<i64>,
    margin_balance: Decimal,
    one_way_mode: bool,
}

/// Follower venue double.
///
/// Limit orders rest on the book; market orders apply to the position
/// immediately. Placements and cancels are recorded for assertions.
pub struct MockFollower {
    state: Mutex<MockFollowerState>,
    order_id_counter: AtomicI64,
}

impl Default for MockFollower {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFollower {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockFollowerState {
                margin_balance: dec!(10000),
                ..Default::default()
            }),
            order_id_counter: AtomicI64::new(1),
        }
    }

    pub async fn set_position(&self, symbol: &str, amount: Decimal, entry: Decimal) {
        self.state
            .lock()
            .await
            .positions
            .insert(symbol.to_string(), (amount, entry));
    }

    pub async fn set_margin_balance(&self, balance: Decimal) {
        self.state.lock().await.margin_balance = balance;
    }

    pub async fn add_open_order(
        &self,
        order_id: i64,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        qty: Decimal,
        reduce_only: bool,
    ) {
        self.state.lock().await.open_orders.insert(
            order_id,
            OpenOrder {
                order_id,
                symbol: symbol.to_string(),
                side,
                status: OrderStatus::New,
                price,
                orig_qty: qty,
                executed_qty: Decimal::ZERO,
                reduce_only,
                time: 0,
            },
        );
    }

    /// Mark a resting order as filled and apply it to the position.
    pub async fn fill_open_order(&self, order_id: i64) {
        let mut state = self.state.lock().await;
        if let Some(order) = state.open_orders.remove(&order_id) {
            let signed = if order.side.is_buy() {
                order.orig_qty
            } else {
                -order.orig_qty
            };
            let entry = state
                .positions
                .get(&order.symbol)
                .map(|(_, e)| *e)
                .unwrap_or(order.price);
            let amount = state
                .positions
                .get(&order.symbol)
                .map(|(a, _)| *a)
                .unwrap_or(Decimal::ZERO);
            state
                .positions
                .insert(order.symbol.clone(), (amount + signed, entry));
            state.statuses.insert(order_id, OrderStatus::Filled);
        }
    }

    pub async fn set_order_status(&self, order_id: i64, status: OrderStatus) {
        self.state.lock().await.statuses.insert(order_id, status);
    }

    pub async fn placed_orders(&self) -> Vec<NewOrder> {
        self.state.lock().await.placed.clone()
    }

    pub async fn canceled_orders(&self) -> Vec<i64> {
        self.state.lock().await.canceled.clone()
    }

    pub async fn one_way_mode(&self) -> bool {
        self.state.lock().await.one_way_mode
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl FollowerExchange for MockFollower {
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse> {
        let order_id = self.next_order_id();
        let mut state = self.state.lock().await;
        state.placed.push(order.clone());

        let status = match order.order_type {
            OrderType::Limit => {
                state.open_orders.insert(
                    order_id,
                    OpenOrder {
                        order_id,
                        symbol: order.symbol.clone(),
                        side: order.side,
                        status: OrderStatus::New,
                        price: order.price.unwrap_or(Decimal::ZERO),
                        orig_qty: order.quantity,
                        executed_qty: Decimal::ZERO,
                        reduce_only: order.reduce_only,
                        time: 0,
                    },
                );
                OrderStatus::New
            }
            OrderType::Market => {
                let signed = if order.side.is_buy() {
                    order.quantity
                } else {
                    -order.quantity
                };
                let (amount, entry) = state
                    .positions
                    .get(&order.symbol)
                    .copied()
                    .unwrap_or((Decimal::ZERO, Decimal::ZERO));
                state
                    .positions
                    .insert(order.symbol.clone(), (amount + signed, entry));
                state.statuses.insert(order_id, OrderStatus::Filled);
                OrderStatus::Filled
            }
        };

        Ok(OrderResponse {
            order_id,
            symbol: order.symbol.clone(),
            status,
            client_order_id: order
                .new_client_order_id
                .clone()
                .unwrap_or_else(|| format!("mock-{order_id}")),
            price: order.price.unwrap_or(Decimal::ZERO),
            avg_price: order.price.unwrap_or(Decimal::ZERO),
            orig_qty: order.quantity,
            executed_qty: match status {
                OrderStatus::Filled => order.quantity,
                _ => Decimal::ZERO,
            },
            side: order.side,
            update_time: 0,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.open_orders.remove(&order_id).is_some() {
            state.statuses.insert(order_id, OrderStatus::Canceled);
        }
        state.canceled.push(order_id);
        Ok(())
    }

    async fn modify_order(
        &self,
        symbol: &str,
        order_id: i64,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse> {
        {
            let mut state = self.state.lock().await;
            state.open_orders.remove(&order_id);
        }
        self.place_order(&NewOrder::limit(symbol, side, quantity, price))
            .await
    }

    async fn query_order(&self, _symbol: &str, order_id: i64) -> Result<Option<OrderStatus>> {
        let state = self.state.lock().await;
        if let Some(order) = state.open_orders.get(&order_id) {
            return Ok(Some(order.status));
        }
        Ok(state.statuses.get(&order_id).copied())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let state = self.state.lock().await;
        let mut orders: Vec<OpenOrder> = state
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        Ok(orders)
    }

    async fn position(&self, symbol: &str) -> Result<PositionRisk> {
        let state = self.state.lock().await;
        let (amount, entry) = state
            .positions
            .get(symbol)
            .copied()
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));
        Ok(PositionRisk {
            symbol: symbol.to_string(),
            position_amt: amount,
            entry_price: entry,
            mark_price: entry,
            liquidation_price: Decimal::ZERO,
        })
    }

    async fn total_margin_balance(&self) -> Result<Decimal> {
        Ok(self.state.lock().await.margin_balance)
    }

    async fn set_one_way_mode(&self) -> Result<()> {
        self.state.lock().await.one_way_mode = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockMasterState {
    open_orders: Vec<MasterOpenOrder>,
    account_value: Decimal,
    /// coin -> (signed size, entry price)
    positions: HashMap<String, (Decimal, Decimal)>,
}

/// Master venue double for snapshot endpoints.
pub struct MockMaster {
    state: Mutex<MockMasterState>,
}

impl Default for MockMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMaster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockMasterState {
                account_value: dec!(100000),
                ..Default::default()
            }),
        }
    }

    pub async fn set_open_orders(&self, orders: Vec<MasterOpenOrder>) {
        self.state.lock().await.open_orders = orders;
    }

    pub async fn set_position(&self, coin: &str, szi: Decimal, entry: Decimal) {
        self.state
            .lock()
            .await
            .positions
            .insert(coin.to_string(), (szi, entry));
    }

    pub async fn set_account_value(&self, value: Decimal) {
        self.state.lock().await.account_value = value;
    }
}

/// Build a Master open order for test fixtures.
pub fn master_open_order(
    oid: u64,
    coin: &str,
    side: OrderSide,
    price: Decimal,
    size: Decimal,
) -> MasterOpenOrder {
    MasterOpenOrder {
        coin: coin.to_string(),
        side: match side {
            OrderSide::Buy => MasterSide::Bid,
            OrderSide::Sell => MasterSide::Ask,
        },
        limit_px: price,
        sz: size,
        oid,
        timestamp: 1_700_000_000_000,
        reduce_only: false,
    }
}

#[async_trait]
impl MasterData for MockMaster {
    async fn open_orders(&self, _user: &str) -> Result<Vec<MasterOpenOrder>> {
        Ok(self.state.lock().await.open_orders.clone())
    }

    async fn clearinghouse_state(&self, _user: &str) -> Result<ClearinghouseState> {
        let state = self.state.lock().await;
        Ok(ClearinghouseState {
            margin_summary: MarginSummary {
                account_value: state.account_value,
            },
            asset_positions: state
                .positions
                .iter()
                .map(|(coin, (szi, entry))| AssetPosition {
                    position: PerpPosition {
                        coin: coin.clone(),
                        szi: *szi,
                        entry_px: Some(*entry),
                    },
                })
                .collect(),
        })
    }
}
