//! Follower venue REST API client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, instrument};

use super::traits::FollowerExchange;
use super::types::{
    AccountInfo, ApiErrorBody, ListenKey, NewOrder, OpenOrder, OrderResponse, OrderSide,
    OrderStatus, PositionRisk, ERR_NO_NEED_TO_CHANGE_POSITION_SIDE, ERR_ORDER_DOES_NOT_EXIST,
    ERR_REJECTED_MBX_KEY, ERR_UNKNOWN_ORDER,
};
use crate::config::BinanceConfig;

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Follower venue API client for the USD-M futures account.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceClient {
    /// Create a new client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = if config.testnet {
            FUTURES_TESTNET_URL.to_string()
        } else {
            FUTURES_BASE_URL.to_string()
        };

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url,
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_millis() as u64
    }

    /// Send a signed request; venue error codes listed in `tolerated` map to
    /// `Ok(None)` instead of an error.
    async fn send_signed<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(String, String)>,
        tolerated: &[i64],
    ) -> Result<Option<T>> {
        params.push(("timestamp".to_string(), Self::timestamp().to_string()));
        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query_string);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query_string, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("Request to {path} failed"))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map(Some)
                .with_context(|| format!("Failed to parse {path} response"));
        }

        let body = response.text().await.unwrap_or_default();
        if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
            if tolerated.contains(&error.code) {
                debug!(path, code = error.code, msg = %error.msg, "Tolerated venue error");
                return Ok(None);
            }
            if error.code == ERR_REJECTED_MBX_KEY {
                anyhow::bail!("API Key has no permissions or IP is not whitelisted");
            }
            anyhow::bail!("Follower venue error {status} ({}): {}", error.code, error.msg);
        }
        anyhow::bail!("Follower venue error {status}: {body}");
    }

    // ==================== User data stream ====================

    /// Obtain a listen key for the signed user-data stream.
    #[instrument(skip(self))]
    pub async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("Failed to create listen key")?;

        let key: ListenKey = response
            .json()
            .await
            .context("Failed to parse listen key response")?;
        Ok(key.listen_key)
    }

    /// Keep the current listen key alive; must run at least every 60 min.
    #[instrument(skip(self))]
    pub async fn keepalive_listen_key(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.http
            .put(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("Failed to keep listen key alive")?;
        Ok(())
    }
}

/// Minimal order view used when querying a single order.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderQueryResponse {
    status: OrderStatus,
}

#[async_trait]
impl FollowerExchange for BinanceClient {
    #[instrument(skip(self, order), fields(symbol = %order.symbol))]
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse> {
        let mut params = vec![
            ("symbol".to_string(), order.symbol.clone()),
            ("side".to_string(), format!("{:?}", order.side).to_uppercase()),
            (
                "type".to_string(),
                format!("{:?}", order.order_type).to_uppercase(),
            ),
            ("quantity".to_string(), order.quantity.to_string()),
            ("newOrderRespType".to_string(), "RESULT".to_string()),
        ];
        if let Some(price) = &order.price {
            params.push(("price".to_string(), price.to_string()));
        }
        if let Some(tif) = &order.time_in_force {
            params.push(("timeInForce".to_string(), format!("{tif:?}").to_uppercase()));
        }
        if order.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }
        if let Some(client_id) = &order.new_client_order_id {
            params.push(("newClientOrderId".to_string(), client_id.clone()));
        }

        debug!("Placing follower order: {:?}", order);
        let placed: OrderResponse = self
            .send_signed(Method::POST, "/fapi/v1/order", params, &[])
            .await?
            .context("Order placement returned no body")?;
        info!(
            symbol = %placed.symbol,
            order_id = placed.order_id,
            status = ?placed.status,
            "Follower order placed"
        );
        Ok(placed)
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let canceled: Option<OrderResponse> = self
            .send_signed(
                Method::DELETE,
                "/fapi/v1/order",
                params,
                &[ERR_UNKNOWN_ORDER, ERR_ORDER_DOES_NOT_EXIST],
            )
            .await?;
        if canceled.is_none() {
            info!(symbol, order_id, "Cancel target already gone");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn modify_order(
        &self,
        symbol: &str,
        order_id: i64,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<OrderResponse> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
            ("side".to_string(), format!("{side:?}").to_uppercase()),
            ("quantity".to_string(), quantity.to_string()),
            ("price".to_string(), price.to_string()),
        ];
        let modified: OrderResponse = self
            .send_signed(Method::PUT, "/fapi/v1/order", params, &[])
            .await?
            .context("Order modification returned no body")?;
        info!(
            symbol,
            old_order_id = order_id,
            new_order_id = modified.order_id,
            "Follower order replaced"
        );
        Ok(modified)
    }

    #[instrument(skip(self))]
    async fn query_order(&self, symbol: &str, order_id: i64) -> Result<Option<OrderStatus>> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let order: Option<OrderQueryResponse> = self
            .send_signed(
                Method::GET,
                "/fapi/v1/order",
                params,
                &[ERR_ORDER_DOES_NOT_EXIST, ERR_UNKNOWN_ORDER],
            )
            .await?;
        Ok(order.map(|o| o.status))
    }

    #[instrument(skip(self))]
    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let orders: Vec<OpenOrder> = self
            .send_signed(Method::GET, "/fapi/v1/openOrders", params, &[])
            .await?
            .unwrap_or_default();
        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn position(&self, symbol: &str) -> Result<PositionRisk> {
        let params = vec![("symbol".to_string(), symbol.to_string())];
        let positions: Vec<PositionRisk> = self
            .send_signed(Method::GET, "/fapi/v2/positionRisk", params, &[])
            .await?
            .unwrap_or_default();
        Ok(positions
            .into_iter()
            .next()
            .unwrap_or_else(|| PositionRisk {
                symbol: symbol.to_string(),
                position_amt: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                mark_price: Decimal::ZERO,
                liquidation_price: Decimal::ZERO,
            }))
    }

    #[instrument(skip(self))]
    async fn total_margin_balance(&self) -> Result<Decimal> {
        let account: AccountInfo = self
            .send_signed(Method::GET, "/fapi/v2/account", Vec::new(), &[])
            .await?
            .context("Account endpoint returned no body")?;
        Ok(account.total_margin_balance)
    }

    #[instrument(skip(self))]
    async fn set_one_way_mode(&self) -> Result<()> {
        let params = vec![("dualSidePosition".to_string(), "false".to_string())];
        let response: Option<serde_json::Value> = self
            .send_signed(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                params,
                &[ERR_NO_NEED_TO_CHANGE_POSITION_SIDE],
            )
            .await?;
        if response.is_none() {
            debug!("Account already in one-way mode");
        }
        Ok(())
    }
}
