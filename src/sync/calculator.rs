//! Size translation between Master and Follower units.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{Config, InstrumentConfig, SizingMode};
use crate::exchange::{FollowerExchange, MasterData};
use crate::utils::decimal::{floor_to_precision, round_to_precision};

/// Whether a translated order increases or reduces the Follower position.
/// Minimum-size policy may differ between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct CachedEquity {
    value: Decimal,
    fetched_at: Instant,
}

/// Translates Master sizes into Follower sizes under the configured sizing
/// mode, applying instrument precision and minimum-size policy.
///
/// Equal mode divides the two accounts' equities; both snapshots are cached
/// for the configured TTL to cap API load, and the reverse translation uses
/// the same snapshots so a round trip is exact.
pub struct PositionCalculator {
    mode: SizingMode,
    fixed_ratio: Decimal,
    equal_ratio: Decimal,
    cache_ttl: Duration,
    instruments: HashMap<String, InstrumentConfig>,
    follower: Arc<dyn FollowerExchange>,
    master: Arc<dyn MasterData>,
    master_account: String,
    follower_equity: RwLock<Option<CachedEquity>>,
    master_equity: RwLock<Option<CachedEquity>>,
}

impl PositionCalculator {
    pub fn new(
        config: &Config,
        follower: Arc<dyn FollowerExchange>,
        master: Arc<dyn MasterData>,
    ) -> Self {
        Self {
            mode: config.sizing.mode,
            fixed_ratio: config.sizing.fixed_ratio,
            equal_ratio: config.sizing.equal_ratio,
            cache_ttl: Duration::from_secs(config.sizing.account_cache_ttl_secs),
            instruments: config.instruments.clone(),
            follower,
            master,
            master_account: config
                .master
                .followed_users
                .first()
                .cloned()
                .unwrap_or_default(),
            follower_equity: RwLock::new(None),
            master_equity: RwLock::new(None),
        }
    }

    pub fn instrument(&self, coin: &str) -> Option<&InstrumentConfig> {
        self.instruments.get(coin)
    }

    /// Minimum Follower size for the instrument and action kind.
    pub fn min_size(&self, coin: &str, action: ActionKind) -> Option<Decimal> {
        let instrument = self.instruments.get(coin)?;
        Some(match action {
            ActionKind::Open => instrument.min_order_size.open(),
            ActionKind::Close => instrument.min_order_size.close(),
        })
    }

    /// Round a Follower quantity to the instrument's precision.
    pub fn quantize(&self, coin: &str, value: Decimal) -> Decimal {
        match self.instruments.get(coin) {
            Some(instrument) => round_to_precision(value, instrument.quantity_decimals),
            None => value,
        }
    }

    /// Round a Follower quantity down to the instrument's precision. Used
    /// for caps, which must never round past the bound they enforce.
    pub fn quantize_down(&self, coin: &str, value: Decimal) -> Decimal {
        match self.instruments.get(coin) {
            Some(instrument) => floor_to_precision(value, instrument.quantity_decimals),
            None => value,
        }
    }

    /// Translate a Master size into a Follower size.
    ///
    /// Returns `None` when the instrument is unknown or the rounded result
    /// falls below the venue minimum for the action; the caller decides
    /// whether to enforce the minimum.
    pub async fn follower_size(
        &self,
        coin: &str,
        master_size: Decimal,
        action: ActionKind,
    ) -> Result<Option<Decimal>> {
        let Some(instrument) = self.instruments.get(coin) else {
            return Ok(None);
        };
        let scaled = master_size * self.ratio().await?;
        // Strip float dust toward zero before rounding to the venue precision.
        let truncated = floor_to_precision(scaled, instrument.quantity_decimals + 2);
        let quantity = round_to_precision(truncated, instrument.quantity_decimals);

        let min = match action {
            ActionKind::Open => instrument.min_order_size.open(),
            ActionKind::Close => instrument.min_order_size.close(),
        };
        if quantity < min {
            debug!(coin, %quantity, %min, "Translated size below venue minimum");
            return Ok(None);
        }
        Ok(Some(quantity))
    }

    /// Reverse translation: Follower size back into Master units, under the
    /// same equity snapshot semantics. Used for orphan-fill adjustments.
    pub async fn master_equivalent(&self, coin: &str, follower_size: Decimal) -> Result<Decimal> {
        let ratio = self.ratio().await?;
        anyhow::ensure!(ratio > Decimal::ZERO, "Sizing ratio must be positive");
        let equivalent = follower_size / ratio;
        let decimals = self
            .instruments
            .get(coin)
            .map(|i| i.quantity_decimals + 4)
            .unwrap_or(8);
        Ok(round_to_precision(equivalent, decimals))
    }

    /// Current Master-to-Follower sizing ratio.
    pub async fn ratio(&self) -> Result<Decimal> {
        match self.mode {
            SizingMode::Fixed => Ok(self.fixed_ratio),
            SizingMode::Equal => {
                let follower = self.follower_equity().await?;
                let master = self.master_equity().await?;
                anyhow::ensure!(
                    master > Decimal::ZERO,
                    "Master equity unavailable for equal-mode sizing"
                );
                Ok(follower / master * self.equal_ratio)
            }
        }
    }

    async fn follower_equity(&self) -> Result<Decimal> {
        if let Some(cached) = *self.follower_equity.read().await {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.value);
            }
        }
        let value = self
            .follower
            .total_margin_balance()
            .await
            .context("Failed to fetch Follower equity")?;
        *self.follower_equity.write().await = Some(CachedEquity {
            value,
            fetched_at: Instant::now(),
        });
        Ok(value)
    }

    async fn master_equity(&self) -> Result<Decimal> {
        if let Some(cached) = *self.master_equity.read().await {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                return Ok(cached.value);
            }
        }
        let state = self
            .master
            .clearinghouse_state(&self.master_account)
            .await
            .context("Failed to fetch Master equity")?;
        let value = state.margin_summary.account_value;
        *self.master_equity.write().await = Some(CachedEquity {
            value,
            fetched_at: Instant::now(),
        });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::config::MinOrderSize;
    use crate::exchange::mock::{MockFollower, MockMaster};
    use rust_decimal_macros::dec;

    fn calculator(config: &Config) -> PositionCalculator {
        PositionCalculator::new(
            config,
            Arc::new(MockFollower::new()),
            Arc::new(MockMaster::new()),
        )
    }

    #[tokio::test]
    async fn test_fixed_mode_translation() {
        let calc = calculator(&test_config());
        // 0.02 * 0.1 = 0.002, exactly the venue minimum
        let size = calc
            .follower_size("BTC", dec!(0.02), ActionKind::Open)
            .await
            .unwrap();
        assert_eq!(size, Some(dec!(0.002)));
    }

    #[tokio::test]
    async fn test_below_minimum_returns_none() {
        let calc = calculator(&test_config());
        // 0.01 * 0.1 = 0.001 < 0.002
        let size = calc
            .follower_size("BTC", dec!(0.01), ActionKind::Open)
            .await
            .unwrap();
        assert_eq!(size, None);
    }

    #[tokio::test]
    async fn test_split_minimum_by_action() {
        let mut config = test_config();
        config.instruments.get_mut("BTC").unwrap().min_order_size = MinOrderSize::Split {
            open: dec!(0.002),
            close: dec!(0.001),
        };
        let calc = calculator(&config);
        assert_eq!(
            calc.follower_size("BTC", dec!(0.01), ActionKind::Open)
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            calc.follower_size("BTC", dec!(0.01), ActionKind::Close)
                .await
                .unwrap(),
            Some(dec!(0.001))
        );
    }

    #[tokio::test]
    async fn test_unknown_instrument_returns_none() {
        let calc = calculator(&test_config());
        assert_eq!(
            calc.follower_size("DOGE", dec!(100), ActionKind::Open)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_reverse_translation() {
        let calc = calculator(&test_config());
        let equivalent = calc.master_equivalent("BTC", dec!(0.002)).await.unwrap();
        assert_eq!(equivalent, dec!(0.02));
    }

    #[tokio::test]
    async fn test_equal_mode_uses_equity_ratio() {
        let mut config = test_config();
        config.sizing.mode = SizingMode::Equal;
        config.sizing.equal_ratio = Decimal::ONE;

        let follower = Arc::new(MockFollower::new());
        follower.set_margin_balance(dec!(10000)).await;
        let master = Arc::new(MockMaster::new());
        master.set_account_value(dec!(100000)).await;

        let calc = PositionCalculator::new(&config, follower, master);
        // ratio = 10000 / 100000 = 0.1
        assert_eq!(calc.ratio().await.unwrap(), dec!(0.1));
        let size = calc
            .follower_size("BTC", dec!(0.05), ActionKind::Open)
            .await
            .unwrap();
        assert_eq!(size, Some(dec!(0.005)));
    }

    #[tokio::test]
    async fn test_rounding_to_instrument_precision() {
        let mut config = test_config();
        config.sizing.fixed_ratio = dec!(0.33);
        let calc = calculator(&config);
        // 0.02 * 0.33 = 0.0066 -> 0.007 at 3 decimals
        let size = calc
            .follower_size("BTC", dec!(0.02), ActionKind::Open)
            .await
            .unwrap();
        assert_eq!(size, Some(dec!(0.007)));
    }
}
