//! Order executor: the central per-event state machine.
//!
//! Consumes classified Master events, consults the mapper, ledger,
//! calculator, and risk gate, and issues side effects through the Follower
//! adapter. Every skip path still settles the delta ledger so the miss
//! stays accounted; every executed path journals its outcome so redelivered
//! events are suppressed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::config::{Config, InstrumentConfig};
use crate::exchange::hyperliquid::{
    MasterEvent, MasterFillEvent, MasterOrderEvent, MasterOrderStatus,
};
use crate::exchange::{futures_symbol, FollowerExchange, NewOrder, OrderSide};
use crate::persistence::KvStore;
use crate::risk::RiskGate;
use crate::state::{
    DeltaLedger, ExecutionOutcome, JournalRecord, OrderMapper, OrphanFills, ProcessedJournal,
};
use crate::sync::calculator::{ActionKind, PositionCalculator};
use crate::sync::rebalancer::ExposureRebalancer;
use crate::utils::decimal::{signed, snap_to_tick, EPSILON};

const LOCK_PREFIX: &str = "orderLock:";

const PLACE_ATTEMPTS: u32 = 3;

pub struct OrderExecutor {
    store: Arc<dyn KvStore>,
    mapper: Arc<OrderMapper>,
    ledger: Arc<DeltaLedger>,
    journal: Arc<ProcessedJournal>,
    orphans: Arc<OrphanFills>,
    calculator: Arc<PositionCalculator>,
    risk: Arc<RiskGate>,
    follower: Arc<dyn FollowerExchange>,
    rebalancer: Arc<ExposureRebalancer>,
    instruments: HashMap<String, InstrumentConfig>,
    lock_ttl: Duration,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        store: Arc<dyn KvStore>,
        mapper: Arc<OrderMapper>,
        ledger: Arc<DeltaLedger>,
        journal: Arc<ProcessedJournal>,
        orphans: Arc<OrphanFills>,
        calculator: Arc<PositionCalculator>,
        risk: Arc<RiskGate>,
        follower: Arc<dyn FollowerExchange>,
        rebalancer: Arc<ExposureRebalancer>,
    ) -> Self {
        Self {
            store,
            mapper,
            ledger,
            journal,
            orphans,
            calculator,
            risk,
            follower,
            rebalancer,
            instruments: config.instruments.clone(),
            lock_ttl: Duration::from_secs(config.engine.order_lock_ttl_secs),
        }
    }

    /// Entry point for the ingest loop. Failures are logged, never fatal.
    pub async fn handle_event(&self, event: MasterEvent) {
        let result = match &event {
            MasterEvent::Order(order) => match order.status {
                MasterOrderStatus::Open | MasterOrderStatus::Triggered => {
                    self.handle_open(order).await
                }
                MasterOrderStatus::Canceled => self.handle_canceled(order).await,
                MasterOrderStatus::Filled => self.handle_filled(order).await,
            },
            MasterEvent::Fill(fill) => self.handle_fill(fill).await,
        };
        if let Err(e) = result {
            error!(error = %e, ?event, "Master event handling failed");
        }
    }

    // ==================== Limit order: Open / Triggered ====================

    pub async fn handle_open(&self, event: &MasterOrderEvent) -> Result<()> {
        if !self.acquire_lock(event.oid).await? {
            debug!(oid = event.oid, "Order lock held elsewhere, skipping");
            return Ok(());
        }
        let result = self.open_inner(event).await;
        self.release_lock(event.oid).await;
        result
    }

    async fn open_inner(&self, event: &MasterOrderEvent) -> Result<()> {
        let event_id = event.oid.to_string();

        // An already-mapped oid re-entering as Open is a price/size change
        // (or a plain redelivery, which replace_if_changed ignores).
        if self.mapper.lookup_follower(event.oid).await?.is_some() {
            return self.replace_if_changed(event).await;
        }
        if self.journal.contains(&event_id).await? {
            debug!(oid = event.oid, "Duplicate Master open event, ignoring");
            return Ok(());
        }

        let Some(instrument) = self.instruments.get(&event.coin).cloned() else {
            let s = signed(event.size, event.side.is_buy());
            self.skip(&event.coin, &event_id, ExecutionOutcome::SkippedRisk, s, event.price)
                .await?;
            warn!(oid = event.oid, coin = %event.coin, "Instrument not whitelisted");
            return Ok(());
        };

        let symbol = futures_symbol(&event.coin);
        let s = signed(event.size, event.side.is_buy());
        let delta_before = self.ledger.get(&event.coin).await?;
        let total = s + delta_before;

        let position = self.follower.position(&symbol).await?;
        let current = position.position_amt;
        let action = action_kind(current, s);

        // Pure limit-copy fidelity: translate the per-order size, not the
        // total requirement; accumulated delta clears via the enforce path.
        let mut quantity = self
            .calculator
            .follower_size(&event.coin, event.size, action)
            .await?;

        let min_size = match action {
            ActionKind::Open => instrument.min_order_size.open(),
            ActionKind::Close => instrument.min_order_size.close(),
        };

        // Reduce-only orders may never exceed the position not already
        // covered by resting reduce-only orders on the close side.
        let mut available = None;
        if event.reduce_only {
            let covered = self.open_reduce_only_qty(&symbol, event.side).await?;
            let headroom = (current.abs() - covered).max(Decimal::ZERO);
            if headroom < min_size {
                // Nothing journaled: safe to act if the event is redelivered
                // with more headroom later.
                info!(
                    oid = event.oid,
                    %headroom,
                    "Reduce-only headroom below minimum, skipping"
                );
                return Ok(());
            }
            if let Some(q) = quantity {
                if q > headroom {
                    quantity = Some(self.calculator.quantize_down(&event.coin, headroom));
                }
            }
            available = Some(headroom);
        }

        // Enforcement: promote a too-small order to the venue minimum when
        // the instrument carries pending delta, converting chronic rounding
        // loss into discrete over-exposure the rebalancer later unwinds.
        let mut outcome = ExecutionOutcome::Placed;
        let quantity = match quantity {
            Some(q) if q > Decimal::ZERO => q,
            _ if delta_before.abs() > EPSILON => {
                outcome = ExecutionOutcome::Enforced;
                let enforced = self.calculator.quantize(&event.coin, min_size);
                match available {
                    Some(headroom) => enforced.min(headroom),
                    None => enforced,
                }
            }
            _ => {
                self.skip(
                    &event.coin,
                    &event_id,
                    ExecutionOutcome::SkippedBelowMin,
                    s,
                    event.price,
                )
                .await?;
                info!(oid = event.oid, size = %event.size, "Below minimum with no pending delta");
                return Ok(());
            }
        };

        if let Err(denial) = self.risk.evaluate(&event.coin, current, quantity) {
            self.skip(&event.coin, &event_id, ExecutionOutcome::SkippedRisk, s, event.price)
                .await?;
            warn!(oid = event.oid, %denial, "Risk gate denied placement");
            return Ok(());
        }

        let price = snap_to_tick(event.price, instrument.price_tick);
        let mut order = NewOrder::limit(&symbol, event.side, quantity, price);
        if event.reduce_only {
            order = order.reduce_only();
        }

        let Some(placed) = self.place_with_retry(&order, &event.coin, s).await? else {
            return Ok(());
        };

        self.mapper
            .save(event.oid, placed.order_id, &event.coin)
            .await?;
        self.journal
            .record(
                &event_id,
                &JournalRecord::executed(outcome, placed.order_id, s, quantity, price),
            )
            .await?;
        // Zero out the portion of the pending delta this placement clears.
        self.ledger.consume(&event.coin, total - s).await?;

        info!(
            oid = event.oid,
            follower_order_id = placed.order_id,
            %quantity,
            %price,
            ?outcome,
            "Mirrored Master limit order"
        );
        self.rebalancer.trigger(&event.coin);
        Ok(())
    }

    /// Cancel-replace when a mapped order re-opens with a new price or size.
    async fn replace_if_changed(&self, event: &MasterOrderEvent) -> Result<()> {
        let Some(mapping) = self.mapper.lookup_follower(event.oid).await? else {
            return Ok(());
        };
        let symbol = futures_symbol(&mapping.instrument);
        let Some(instrument) = self.instruments.get(&mapping.instrument) else {
            return Ok(());
        };

        let open_orders = self.follower.open_orders(&symbol).await?;
        let Some(existing) = open_orders
            .iter()
            .find(|o| o.order_id == mapping.follower_order_id)
        else {
            // Already filled or canceled; reconciliation owns the cleanup.
            debug!(oid = event.oid, "Mapped order no longer resting, skipping replace");
            return Ok(());
        };

        let price = snap_to_tick(event.price, instrument.price_tick);
        let position = self.follower.position(&symbol).await?;
        let action = action_kind(
            position.position_amt,
            signed(event.size, event.side.is_buy()),
        );
        let quantity = self
            .calculator
            .follower_size(&event.coin, event.size, action)
            .await?
            .unwrap_or(existing.orig_qty);

        if existing.price == price && existing.orig_qty == quantity {
            return Ok(());
        }

        let replaced = self
            .follower
            .modify_order(&symbol, existing.order_id, event.side, quantity, price)
            .await?;
        self.mapper.delete(event.oid).await?;
        self.mapper
            .save(event.oid, replaced.order_id, &mapping.instrument)
            .await?;
        let s = signed(event.size, event.side.is_buy());
        self.journal
            .record(
                &event.oid.to_string(),
                &JournalRecord::executed(
                    ExecutionOutcome::Replaced,
                    replaced.order_id,
                    s,
                    quantity,
                    price,
                ),
            )
            .await?;
        info!(
            oid = event.oid,
            old_follower_order_id = existing.order_id,
            new_follower_order_id = replaced.order_id,
            "Replaced mirrored order"
        );
        Ok(())
    }

    // ==================== Limit order: Canceled ====================

    async fn handle_canceled(&self, event: &MasterOrderEvent) -> Result<()> {
        let Some(mapping) = self.mapper.lookup_follower(event.oid).await? else {
            debug!(oid = event.oid, "Cancel for unmapped order, ignoring");
            return Ok(());
        };
        let symbol = futures_symbol(&mapping.instrument);
        self.follower
            .cancel_order(&symbol, mapping.follower_order_id)
            .await?;
        self.mapper.delete(event.oid).await?;
        info!(
            oid = event.oid,
            follower_order_id = mapping.follower_order_id,
            "Canceled mirrored order"
        );
        Ok(())
    }

    // ==================== Limit order: Filled ====================

    async fn handle_filled(&self, event: &MasterOrderEvent) -> Result<()> {
        // A Follower fill observed first pre-credited the ledger; the
        // Master's own fill notification reverses that provisional entry.
        if let Some(orphan) = self.orphans.take(event.oid).await? {
            self.ledger
                .add(&orphan.instrument, orphan.master_size_equivalent)
                .await?;
            info!(
                oid = event.oid,
                equivalent = %orphan.master_size_equivalent,
                "Resolved orphan fill"
            );
        }

        if let Some(mapping) = self.mapper.lookup_follower(event.oid).await? {
            let symbol = futures_symbol(&mapping.instrument);
            match self
                .follower
                .query_order(&symbol, mapping.follower_order_id)
                .await?
            {
                Some(status) if !status.is_terminal() => {
                    // Keep the mapping so late duplicates stay suppressed.
                    debug!(
                        oid = event.oid,
                        ?status,
                        "Follower order still live after Master fill"
                    );
                }
                _ => self.mapper.delete(event.oid).await?,
            }
        }

        self.rebalancer.trigger(&event.coin);
        Ok(())
    }

    // ==================== Taker fill ====================

    async fn handle_fill(&self, fill: &MasterFillEvent) -> Result<()> {
        let event_id = fill.event_id();
        if self.journal.contains(&event_id).await? {
            debug!(event_id, "Duplicate Master fill, ignoring");
            return Ok(());
        }

        let s = signed(fill.size, fill.side.is_buy());
        let delta_before = self.ledger.get(&fill.coin).await?;
        let total = s + delta_before;

        // Fills absorb accumulated catch-up, but only when the outstanding
        // requirement still points the same way as the fill itself.
        if total.abs() <= EPSILON || (total > Decimal::ZERO) != (s > Decimal::ZERO) {
            self.skip(
                &fill.coin,
                &event_id,
                ExecutionOutcome::SkippedDirection,
                s,
                fill.price,
            )
            .await?;
            info!(event_id, %total, "Fill direction does not match requirement");
            return Ok(());
        }

        let symbol = futures_symbol(&fill.coin);
        let position = self.follower.position(&symbol).await?;
        let current = position.position_amt;
        let action = action_kind(current, s);

        let Some(mut quantity) = self
            .calculator
            .follower_size(&fill.coin, total.abs(), action)
            .await?
        else {
            self.skip(
                &fill.coin,
                &event_id,
                ExecutionOutcome::SkippedBelowMin,
                s,
                fill.price,
            )
            .await?;
            return Ok(());
        };

        // One-way mode: a closing market order may not overshoot into the
        // opposite direction.
        if action == ActionKind::Close && quantity > current.abs() {
            quantity = self.calculator.quantize_down(&fill.coin, current.abs());
        }
        if quantity <= Decimal::ZERO {
            self.skip(
                &fill.coin,
                &event_id,
                ExecutionOutcome::SkippedBelowMin,
                s,
                fill.price,
            )
            .await?;
            return Ok(());
        }

        if let Err(denial) = self.risk.evaluate(&fill.coin, current, quantity) {
            self.skip(
                &fill.coin,
                &event_id,
                ExecutionOutcome::SkippedRisk,
                s,
                fill.price,
            )
            .await?;
            warn!(event_id, %denial, "Risk gate denied fill mirror");
            return Ok(());
        }

        let order = NewOrder::market(&symbol, fill.side, quantity);
        let Some(placed) = self.place_with_retry(&order, &fill.coin, s).await? else {
            return Ok(());
        };

        self.journal
            .record(
                &event_id,
                &JournalRecord::executed(
                    ExecutionOutcome::Placed,
                    placed.order_id,
                    s,
                    quantity,
                    fill.price,
                ),
            )
            .await?;
        self.ledger.consume(&fill.coin, total - s).await?;

        info!(
            event_id,
            follower_order_id = placed.order_id,
            %quantity,
            "Mirrored Master taker fill"
        );
        self.rebalancer.trigger(&fill.coin);
        Ok(())
    }

    // ==================== Helpers ====================

    /// Journal a skip outcome and credit the delta so the miss is accounted.
    async fn skip(
        &self,
        coin: &str,
        event_id: &str,
        outcome: ExecutionOutcome,
        s: Decimal,
        price: Decimal,
    ) -> Result<()> {
        self.ledger.add(coin, s).await?;
        self.journal
            .record(event_id, &JournalRecord::skipped(outcome, s, price))
            .await
    }

    /// Place with bounded retries. A final failure credits the delta and
    /// leaves the journal untouched, so the snapshot-reconcile pass can
    /// retry the order; the consume-on-success accounting then rebalances.
    async fn place_with_retry(
        &self,
        order: &NewOrder,
        coin: &str,
        s: Decimal,
    ) -> Result<Option<crate::exchange::OrderResponse>> {
        let mut last_error = None;
        for attempt in 1..=PLACE_ATTEMPTS {
            match self.follower.place_order(order).await {
                Ok(response) => return Ok(Some(response)),
                Err(e) => {
                    warn!(attempt, error = %e, "Follower placement failed");
                    last_error = Some(e);
                    if attempt < PLACE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                    }
                }
            }
        }
        self.ledger.add(coin, s).await?;
        warn!(
            coin,
            error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
            "Placement abandoned after retries, delta credited"
        );
        Ok(None)
    }

    /// Total resting reduce-only quantity on the given side.
    async fn open_reduce_only_qty(&self, symbol: &str, side: OrderSide) -> Result<Decimal> {
        Ok(self
            .follower
            .open_orders(symbol)
            .await?
            .iter()
            .filter(|o| o.reduce_only && o.side == side)
            .map(|o| o.remaining_qty())
            .sum())
    }

    async fn acquire_lock(&self, oid: u64) -> Result<bool> {
        self.store
            .set_nx(&format!("{LOCK_PREFIX}{oid}"), "1", Some(self.lock_ttl))
            .await
            .context("Failed to acquire order lock")
    }

    /// Best effort; the TTL guarantees eventual release either way.
    async fn release_lock(&self, oid: u64) {
        if let Err(e) = self.store.delete(&format!("{LOCK_PREFIX}{oid}")).await {
            warn!(oid, error = %e, "Failed to release order lock");
        }
    }
}

fn action_kind(current_position: Decimal, s: Decimal) -> ActionKind {
    if current_position != Decimal::ZERO
        && (current_position > Decimal::ZERO) != (s > Decimal::ZERO)
    {
        ActionKind::Close
    } else {
        ActionKind::Open
    }
}
