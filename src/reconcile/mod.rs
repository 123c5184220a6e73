//! Reconciliation loop: every cycle, re-derive lifecycle state from what
//! the exchange actually holds. Handles restarts (adopting live positions),
//! external closures, orphaned safety orders, and the optional TP/SL
//! recalculation. The sleep between cycles is the exchange client's
//! adaptive delay.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{BotConfig, DcaMode, SettingsStore};
use crate::engine::Engine;
use crate::exchange::{ExchangeClient, PositionInfo, TradingStopRequest};
use crate::models::Side;

pub struct Reconciler {
    cfg: BotConfig,
    client: Arc<ExchangeClient>,
    engine: Arc<Engine>,
    settings: Arc<SettingsStore>,
}

impl Reconciler {
    pub fn new(
        cfg: BotConfig,
        client: Arc<ExchangeClient>,
        engine: Arc<Engine>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            cfg,
            client,
            engine,
            settings,
        }
    }

    /// Loop forever: one iteration, then sleep the client's current delay.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.iterate().await {
                error!("Reconciliation cycle failed: {:#}", e);
            }
            tokio::time::sleep(self.client.current_delay()).await;
        }
    }

    /// One reconciliation pass against a fresh exchange snapshot.
    pub async fn iterate(&self) -> anyhow::Result<()> {
        self.client.invalidate_all();

        let positions = self.client.get_positions(true).await?;
        let live: Vec<PositionInfo> = positions.into_iter().filter(|p| p.size > 0.0).collect();

        let balance = self.client.get_wallet_balance(true).await?;
        debug!(
            "Reconciling {} live position(s), balance {:.2} USDT",
            live.len(),
            balance.whole_balance()
        );

        for position in &live {
            let per_order = self
                .settings
                .pair(&position.symbol)
                .map(|p| p.order_size * position.avg_price);
            self.engine.adopt_position(position, per_order);
        }

        let pruned = self.engine.prune_closed(&live);
        if !pruned.is_empty() {
            info!("Dropped {} externally closed position(s)", pruned.len());
        }

        self.engine.valuation_tick(&live);

        if self.cfg.recalc_sl_tp {
            for position in &live {
                self.recalc_protection(position).await;
            }
        }

        self.sweep_orphans(&live).await;
        Ok(())
    }

    /// Push freshly computed TP/SL for a live position. A fast-market
    /// rejection gets exactly one reprice from the book before giving up.
    async fn recalc_protection(&self, position: &PositionInfo) {
        if self.cfg.paused_symbols.contains(&position.symbol) {
            return;
        }
        let instrument = match self.client.get_instruments_info(true).await {
            Ok(list) => list.into_iter().find(|i| i.symbol == position.symbol),
            Err(e) => {
                warn!("{}: instrument fetch failed: {}", position.symbol, e);
                return;
            }
        };
        let Some(instrument) = instrument else {
            return;
        };
        let dp = instrument.tick_decimals();

        let (take_profit, stop_loss) =
            self.engine
                .protection_prices(position.side, position.avg_price, dp);
        let mut req = TradingStopRequest::new(&position.symbol, position.side);
        req.take_profit = take_profit;
        req.stop_loss = stop_loss;

        match self.client.set_trading_stop(&req).await {
            Ok(()) => debug!("{}: protection refreshed", position.symbol),
            Err(e) if e.is_noop() => {}
            Err(e) if e.is_fast_market() => {
                let book_price = match self.client.get_ticker(&position.symbol, true).await {
                    Ok(ticker) => match position.side {
                        Side::Buy => ticker.bid_price,
                        Side::Sell => ticker.ask_price,
                    },
                    Err(e) => {
                        warn!("{}: reprice ticker fetch failed: {}", position.symbol, e);
                        return;
                    }
                };
                let (take_profit, stop_loss) =
                    self.engine.protection_prices(position.side, book_price, dp);
                let mut retry = TradingStopRequest::new(&position.symbol, position.side);
                retry.take_profit = take_profit;
                retry.stop_loss = stop_loss;
                match self.client.set_trading_stop(&retry).await {
                    Ok(()) => info!("{}: protection repriced from the book", position.symbol),
                    Err(e) if e.is_noop() => {}
                    Err(e) => warn!("{}: reprice failed, giving up: {}", position.symbol, e),
                }
            }
            Err(e) => warn!("{}: protection update failed: {}", position.symbol, e),
        }
    }

    /// Cancel resting safety orders whose position is gone. Only relevant
    /// in averaging-by-schedule mode where ladders can outlive a close.
    pub async fn sweep_orphans(&self, live: &[PositionInfo]) {
        if !(self.cfg.use_dca && self.cfg.dca_mode == DcaMode::AverageEntries) {
            return;
        }
        let orders = match self.client.get_new_orders(true).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Orphan sweep skipped, order fetch failed: {}", e);
                return;
            }
        };

        let live_symbols: HashSet<&str> = live.iter().map(|p| p.symbol.as_str()).collect();
        let orphaned: HashSet<&str> = orders
            .iter()
            .filter(|o| !live_symbols.contains(o.symbol.as_str()))
            .map(|o| o.symbol.as_str())
            .collect();

        for symbol in orphaned {
            match self.client.cancel_all_orders(symbol).await {
                Ok(()) => info!("{}: cancelled orphaned safety orders", symbol),
                Err(e) if e.is_noop() => {}
                Err(e) => warn!("{}: orphan cancel failed: {}", symbol, e),
            }
        }
    }
}
