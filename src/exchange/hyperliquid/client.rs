//! Master venue REST client.
//!
//! Read-only access to the info endpoint: open-order snapshots and account
//! state. All requests are unauthenticated POSTs keyed by the followed
//! account address.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use super::types::{ClearinghouseState, InfoRequest, MasterOpenOrder};
use crate::exchange::traits::MasterData;

/// Master venue API client.
#[derive(Debug, Clone)]
pub struct HyperliquidClient {
    client: Client,
    base_url: String,
}

impl HyperliquidClient {
    /// Create a client against the configured API endpoint.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_info<T: serde::de::DeserializeOwned>(&self, request: &InfoRequest) -> Result<T> {
        let url = format!("{}/info", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Failed to send info request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Master venue API error {status}: {body}");
        }

        response.json().await.context("Failed to parse info response")
    }
}

#[async_trait]
impl MasterData for HyperliquidClient {
    #[instrument(skip(self), name = "hl_open_orders")]
    async fn open_orders(&self, user: &str) -> Result<Vec<MasterOpenOrder>> {
        let orders: Vec<MasterOpenOrder> = self
            .post_info(&InfoRequest::OpenOrders {
                user: user.to_string(),
            })
            .await?;
        debug!(user, count = orders.len(), "Fetched Master open orders");
        Ok(orders)
    }

    #[instrument(skip(self), name = "hl_clearinghouse_state")]
    async fn clearinghouse_state(&self, user: &str) -> Result<ClearinghouseState> {
        let state: ClearinghouseState = self
            .post_info(&InfoRequest::ClearinghouseState {
                user: user.to_string(),
            })
            .await?;
        debug!(
            user,
            positions = state.asset_positions.len(),
            "Fetched Master account state"
        );
        Ok(state)
    }
}
