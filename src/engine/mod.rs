//! Position lifecycle engine.
//!
//! Owns the active-trade table and global statistics. Consumes aggregator
//! signals (entries, liquidation-driven averaging) and exchange fill
//! notifications (confirmations, closes), and drives the exchange client.

pub mod stats;
pub mod trade;

pub use stats::GlobalStats;
pub use trade::{Trade, TradeTable};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::aggregator::SharedCooldowns;
use crate::config::{BotConfig, DcaMode, PairSettings, SettingsStore};
use crate::exchange::{
    ExchangeClient, ExchangeError, InstrumentInfo, OrderRequest, PositionInfo,
};
use crate::models::{
    round_dp, CloseReason, LiquidationSignal, OrderUpdateEvent, Side, StopOrderEvent,
};
use crate::notify::Notifier;
use crate::persistence::StatsRepository;

/// Outcome of handling one signal. Exchange-call failures never propagate
/// raw; they collapse into a disposition the dispatch loop can log.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Entered,
    Averaged,
    Skipped(String),
    Abandoned(String),
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Entered => write!(f, "entry order placed"),
            Disposition::Averaged => write!(f, "averaging order placed"),
            Disposition::Skipped(reason) => write!(f, "skipped: {}", reason),
            Disposition::Abandoned(reason) => write!(f, "abandoned: {}", reason),
        }
    }
}

pub struct Engine {
    cfg: BotConfig,
    client: Arc<ExchangeClient>,
    settings: Arc<SettingsStore>,
    notifier: Arc<dyn Notifier>,
    cooldowns: SharedCooldowns,
    trades: Mutex<TradeTable>,
    stats: Mutex<GlobalStats>,
    stats_repo: StatsRepository,
    /// Signal notional per symbol with an entry order in flight, consumed
    /// when the fill confirms the trade
    pending_triggers: Mutex<HashMap<String, f64>>,
    /// Symbols knocked out by terminal rejections; never retried
    filtered: Mutex<HashSet<String>>,
    paused: AtomicBool,
}

impl Engine {
    pub fn new(
        cfg: BotConfig,
        client: Arc<ExchangeClient>,
        settings: Arc<SettingsStore>,
        notifier: Arc<dyn Notifier>,
        cooldowns: SharedCooldowns,
    ) -> Self {
        let stats_repo = StatsRepository::new(&cfg.stats_path);
        let stats = stats_repo.load();
        Self {
            cfg,
            client,
            settings,
            notifier,
            cooldowns,
            trades: Mutex::new(TradeTable::new()),
            stats: Mutex::new(stats),
            stats_repo,
            pending_triggers: Mutex::new(HashMap::new()),
            filtered: Mutex::new(HashSet::new()),
            paused: AtomicBool::new(false),
        }
    }

    // ---- read-only hooks for the dashboard layer ----

    pub fn trades_snapshot(&self) -> Vec<Trade> {
        self.trades.lock().unwrap().iter().cloned().collect()
    }

    pub fn stats_snapshot(&self) -> GlobalStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.trades.lock().unwrap().len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    // ---- signal path ----

    /// Decide what to do with one aggregator signal: open, average into an
    /// existing position, or skip.
    pub async fn handle_signal(&self, signal: LiquidationSignal) -> Disposition {
        let symbol = signal.symbol.clone();

        let Some(pair) = self.settings.pair(&symbol) else {
            warn!("{}: signal for a symbol with no settings, discarding", symbol);
            return Disposition::Skipped("no settings for symbol".to_string());
        };

        let existing = self.trades.lock().unwrap().get(&symbol).cloned();
        if let Some(trade) = existing {
            return self.try_average(&signal, &trade, &pair).await;
        }

        // Pause and the filtered list only gate brand-new entries; an open
        // position keeps averaging and closing normally.
        if self.is_paused() {
            return Disposition::Skipped("trading is paused".to_string());
        }
        if self.cfg.paused_symbols.contains(&symbol) {
            return Disposition::Skipped("symbol is paused".to_string());
        }
        if self.filtered.lock().unwrap().contains(&symbol) {
            return Disposition::Skipped("symbol was filtered out".to_string());
        }

        self.try_enter(&signal, &pair).await
    }

    /// Liquidation-driven averaging: market-add to a losing position when
    /// another cascade hits the same symbol on the same side.
    async fn try_average(
        &self,
        signal: &LiquidationSignal,
        trade: &Trade,
        pair: &PairSettings,
    ) -> Disposition {
        if !(self.cfg.use_dca && self.cfg.dca_mode == DcaMode::Liquidations) {
            return Disposition::Skipped("position already open".to_string());
        }
        if trade.side != signal.side {
            return Disposition::Skipped("position open on the other side".to_string());
        }
        if trade.size + pair.order_size > pair.max_position_size {
            return Disposition::Skipped("max position size reached".to_string());
        }

        let position = match self.client.get_positions(false).await {
            Ok(positions) => positions.into_iter().find(|p| p.symbol == signal.symbol),
            Err(e) => return Disposition::Abandoned(format!("position fetch failed: {}", e)),
        };
        let Some(position) = position else {
            return Disposition::Abandoned("no live position behind the trade record".to_string());
        };
        if position.unrealised_pnl >= 0.0 {
            return Disposition::Skipped("position not under water".to_string());
        }

        let req = OrderRequest::market(&signal.symbol, signal.side, pair.order_size);
        match self.client.submit_order(&req).await {
            Ok(_) => {
                info!(
                    "{}: averaging {} by {} on a new {:.0} USDT cascade",
                    signal.symbol, signal.side.direction(), pair.order_size, signal.cumulative_qty
                );
                Disposition::Averaged
            }
            Err(e) => self.order_failure(&signal.symbol, e),
        }
    }

    async fn try_enter(&self, signal: &LiquidationSignal, pair: &PairSettings) -> Disposition {
        {
            let trades = self.trades.lock().unwrap();
            if trades.len() >= self.cfg.max_open_positions {
                return Disposition::Skipped("open position cap reached".to_string());
            }
            if self.cfg.side_balance {
                let side_cap = (self.cfg.max_open_positions / 2).max(1);
                if trades.count_side(signal.side) >= side_cap {
                    return Disposition::Skipped("side balance cap reached".to_string());
                }
            }
        }

        // Stale-signal guard: a cascade that printed at or past the entry
        // bound already ran away from us.
        match signal.side {
            Side::Buy if signal.price >= pair.long_price => {
                return Disposition::Skipped(format!(
                    "liquidation price {} at or above the long entry bound {}",
                    signal.price, pair.long_price
                ));
            }
            Side::Sell if signal.price <= pair.short_price => {
                return Disposition::Skipped(format!(
                    "liquidation price {} at or below the short entry bound {}",
                    signal.price, pair.short_price
                ));
            }
            _ => {}
        }

        let ticker = match self.client.get_ticker(&signal.symbol, false).await {
            Ok(ticker) => ticker,
            Err(e) => return Disposition::Abandoned(format!("ticker fetch failed: {}", e)),
        };

        if self.cfg.volatility_threshold_pct > 0.0 {
            match self
                .client
                .get_klines(&signal.symbol, 1, self.cfg.volatility_period)
                .await
            {
                Ok(klines) if !klines.is_empty() => {
                    let high = klines.iter().fold(f64::MIN, |acc, k| acc.max(k.high));
                    let low = klines.iter().fold(f64::MAX, |acc, k| acc.min(k.low));
                    let swing_pct = (high - low) / low * 100.0;
                    if swing_pct > self.cfg.volatility_threshold_pct {
                        return Disposition::Skipped(format!(
                            "volatility {:.2}% over the {:.2}% limit",
                            swing_pct, self.cfg.volatility_threshold_pct
                        ));
                    }
                }
                Ok(_) => {}
                Err(e) => return Disposition::Abandoned(format!("kline fetch failed: {}", e)),
            }
        }

        let instrument = match self.client.get_instruments_info(true).await {
            Ok(list) => list.into_iter().find(|i| i.symbol == signal.symbol),
            Err(e) => return Disposition::Abandoned(format!("instrument fetch failed: {}", e)),
        };
        let Some(instrument) = instrument else {
            warn!("{}: not in instrument info, discarding signal", signal.symbol);
            return Disposition::Skipped("unknown instrument".to_string());
        };

        let qty = match self.entry_qty(pair, ticker.last_price, &instrument).await {
            Ok(qty) => qty,
            Err(reason) => return reason,
        };

        let (take_profit, stop_loss) =
            self.protection_prices(signal.side, ticker.last_price, instrument.tick_decimals());

        if let Err(e) = self.client.set_leverage(&signal.symbol, self.cfg.leverage).await {
            if !e.is_noop() {
                warn!("{}: leverage update failed: {}", signal.symbol, e);
            }
        }

        let req = OrderRequest::market(&signal.symbol, signal.side, qty)
            .with_protection(take_profit, stop_loss);
        if let Err(e) = self.client.submit_order(&req).await {
            return self.order_failure(&signal.symbol, e);
        }

        self.pending_triggers
            .lock()
            .unwrap()
            .insert(signal.symbol.clone(), signal.cumulative_qty);

        info!(
            "{}: {} entry {} @ ~{} (tp {:?} / sl {:?}) on {:.0} USDT liquidated",
            signal.symbol,
            signal.side.direction(),
            qty,
            ticker.last_price,
            take_profit,
            stop_loss,
            signal.cumulative_qty
        );

        if self.cfg.use_dca && self.cfg.dca_mode == DcaMode::AverageEntries {
            self.place_dca_ladder(&signal.symbol, signal.side, ticker.last_price, qty, &instrument)
                .await;
        }

        Disposition::Entered
    }

    /// Order size in base units. The pair setting wins; a zero setting
    /// falls back to a percent-of-balance sizing at current price.
    async fn entry_qty(
        &self,
        pair: &PairSettings,
        price: f64,
        instrument: &InstrumentInfo,
    ) -> Result<f64, Disposition> {
        if pair.order_size > 0.0 {
            return Ok(pair.order_size);
        }
        let balance = self
            .client
            .get_wallet_balance(true)
            .await
            .map_err(|e| Disposition::Abandoned(format!("balance fetch failed: {}", e)))?;
        let notional = balance.whole_balance() * self.cfg.percent_order_size / 100.0
            * self.cfg.leverage;
        let qty = round_dp(notional / price, instrument.qty_decimals());
        if qty < instrument.min_order_qty {
            return Err(Disposition::Skipped(format!(
                "computed qty {} below the minimum {}",
                qty, instrument.min_order_qty
            )));
        }
        Ok(qty)
    }

    pub(crate) fn protection_prices(
        &self,
        side: Side,
        price: f64,
        dp: u32,
    ) -> (Option<f64>, Option<f64>) {
        let leverage = self.cfg.leverage.max(1.0);
        let take_profit = self.cfg.use_take_profit.then(|| {
            let delta = price * self.cfg.take_profit_pct / 100.0 / leverage;
            let raw = match side {
                Side::Buy => price + delta,
                Side::Sell => price - delta,
            };
            round_dp(raw, dp)
        });
        let stop_loss = self.cfg.use_stop_loss.then(|| {
            let delta = price * self.cfg.stop_loss_pct / 100.0 / leverage;
            let raw = match side {
                Side::Buy => price - delta,
                Side::Sell => price + delta,
            };
            round_dp(raw, dp)
        });
        (take_profit, stop_loss)
    }

    /// Resting limit ladder below (long) or above (short) the entry.
    /// Rungs go out sequentially; the first failure aborts the remainder
    /// without rolling back what already rests.
    async fn place_dca_ladder(
        &self,
        symbol: &str,
        side: Side,
        entry_price: f64,
        base_qty: f64,
        instrument: &InstrumentInfo,
    ) {
        let price_dp = instrument.tick_decimals();
        let qty_dp = instrument.qty_decimals();

        for rung in 1..=self.cfg.dca_safety_orders {
            let deviation = self.cfg.dca_price_deviation_pct * rung as f64 / 100.0;
            let raw = match side {
                Side::Buy => entry_price * (1.0 - deviation),
                Side::Sell => entry_price * (1.0 + deviation),
            };
            let rung_price = round_dp(raw, price_dp);
            let rung_qty = round_dp(
                base_qty * self.cfg.dca_volume_scale.powi(rung as i32),
                qty_dp,
            );

            let req = OrderRequest::limit(symbol, side, rung_qty, rung_price);
            match self.client.submit_order(&req).await {
                Ok(_) => debug!("{}: safety order {} resting at {}", symbol, rung, rung_price),
                Err(e) => {
                    warn!(
                        "{}: safety order {} failed ({}), aborting remaining rungs",
                        symbol, rung, e
                    );
                    break;
                }
            }
        }
    }

    fn order_failure(&self, symbol: &str, err: ExchangeError) -> Disposition {
        if err.is_noop() {
            return Disposition::Skipped(format!("no-op rejection: {}", err));
        }
        match err {
            // 10001 is a parameter rejection: the symbol is not tradable
            // as configured, retrying the same request cannot succeed
            ExchangeError::Rejected { code: 10001, ref msg } => {
                self.filtered.lock().unwrap().insert(symbol.to_string());
                self.notifier
                    .notify(format!("{} rejected by exchange, filtered out: {}", symbol, msg));
                Disposition::Abandoned(format!("terminal rejection: {}", err))
            }
            other => Disposition::Abandoned(format!("order failed: {}", other)),
        }
    }

    // ---- fill path ----

    /// Order-channel fan-out. Each fill is handled independently; one bad
    /// payload never blocks the rest of the batch.
    pub async fn handle_order_updates(&self, updates: Vec<OrderUpdateEvent>) {
        for update in updates {
            let symbol = update.symbol.clone();
            if let Err(e) = self.handle_fill(&update).await {
                error!("{}: fill handling failed: {:#}", symbol, e);
            }
        }
    }

    async fn handle_fill(&self, update: &OrderUpdateEvent) -> anyhow::Result<()> {
        if !update.is_filled() {
            return Ok(());
        }

        enum Outcome {
            Opened(f64),
            Averaged(f64),
            Closed(Trade, CloseReason),
            Ignored(&'static str),
        }

        let outcome = {
            let mut trades = self.trades.lock().unwrap();
            let resolved = trades
                .get(&update.symbol)
                .map(|t| t.resolved_close(update.resolved_reason()));

            match resolved {
                Some(Some(reason)) if reason.is_close() => {
                    let trade = trades
                        .remove(&update.symbol)
                        .ok_or_else(|| anyhow::anyhow!("trade vanished mid-close"))?;
                    Outcome::Closed(trade, reason)
                }
                // Only DCA produces further same-symbol fills on purpose; with
                // the feature off a second fill is outside intervention and
                // must not distort the averaged entry or the dca count.
                Some(_) if !self.cfg.use_dca => {
                    Outcome::Ignored("fill on a tracked symbol with averaging disabled")
                }
                Some(_) => {
                    let trade = trades
                        .get_mut(&update.symbol)
                        .ok_or_else(|| anyhow::anyhow!("trade vanished mid-average"))?;
                    trade.average(update.last_exec_price, update.qty);
                    Outcome::Averaged(trade.averaged_price)
                }
                None => match update.resolved_reason() {
                    Some(reason) if reason.is_close() => {
                        Outcome::Ignored("close fill for an unknown position")
                    }
                    _ => {
                        let trigger = self
                            .pending_triggers
                            .lock()
                            .unwrap()
                            .remove(&update.symbol)
                            .unwrap_or(0.0);
                        let trade = Trade::open(
                            &update.symbol,
                            update.side,
                            update.last_exec_price,
                            update.qty,
                            trigger,
                        );
                        trades.insert(trade);
                        Outcome::Opened(update.last_exec_price)
                    }
                },
            }
        };

        match outcome {
            Outcome::Opened(price) => {
                info!("{}: entry confirmed at {}", update.symbol, price);
                self.notifier.notify(format!(
                    "Opened {} {} @ {}",
                    update.side.direction(),
                    update.symbol,
                    price
                ));
            }
            Outcome::Averaged(avg) => {
                info!("{}: averaged, entry now {}", update.symbol, avg);
            }
            Outcome::Closed(trade, reason) => {
                self.settle_close(&trade, reason).await?;
            }
            Outcome::Ignored(why) => {
                debug!("{}: {}, ignoring", update.symbol, why);
            }
        }
        Ok(())
    }

    async fn settle_close(&self, trade: &Trade, reason: CloseReason) -> anyhow::Result<()> {
        {
            let mut stats = self.stats.lock().unwrap();
            match reason {
                CloseReason::TakeProfit => stats.record_win(),
                CloseReason::StopLoss => stats.record_loss(),
                CloseReason::CreateByUser => {}
            }
            stats.record_close(trade.max_adverse_excursion);
            self.stats_repo.save(&stats)?;
        }

        if reason == CloseReason::StopLoss && self.cfg.use_stop_loss_timeout {
            self.cooldowns
                .lock()
                .unwrap()
                .arm(&trade.symbol, self.cfg.stop_loss_timeout);
        }

        info!(
            "{}: {} closed by {:?} after {} DCA fill(s), worst pnl {:.4}",
            trade.symbol,
            trade.side.direction(),
            reason,
            trade.dca_count,
            trade.max_adverse_excursion
        );
        self.notifier.notify(format!(
            "Closed {} {} by {:?} (entry {}, worst pnl {:.4})",
            trade.side.direction(),
            trade.symbol,
            reason,
            trade.averaged_price,
            trade.max_adverse_excursion
        ));

        // Sweep any still-resting safety orders for the symbol
        if self.cfg.use_dca && self.cfg.dca_mode == DcaMode::AverageEntries {
            match self.client.cancel_all_orders(&trade.symbol).await {
                Ok(()) => {}
                Err(e) if e.is_noop() => {}
                Err(e) => warn!("{}: safety order sweep failed: {}", trade.symbol, e),
            }
        }
        Ok(())
    }

    /// Stop-order channel: a triggered protective order tells us how the
    /// position will close before the fill notification lands.
    pub fn handle_stop_order(&self, event: &StopOrderEvent) {
        let Some(reason) = event.stop_order_type else {
            return;
        };
        if !reason.is_close() {
            return;
        }
        if event.order_status != "Triggered" && event.order_status != "Filled" {
            return;
        }

        if let Some(trade) = self.trades.lock().unwrap().get_mut(&event.symbol) {
            trade.close_type = Some(reason);
        }

        if reason == CloseReason::StopLoss && self.cfg.use_stop_loss_timeout {
            self.cooldowns
                .lock()
                .unwrap()
                .arm(&event.symbol, self.cfg.stop_loss_timeout);
            info!(
                "{}: stop loss triggered, cooling down for {:?}",
                event.symbol, self.cfg.stop_loss_timeout
            );
        }
    }

    // ---- reconciliation hooks ----

    /// Refresh the worst-loss watermark of every open trade and arm the
    /// drawdown cooldown where the threshold is breached.
    pub fn valuation_tick(&self, positions: &[PositionInfo]) {
        let leverage = self.cfg.leverage.max(1.0);
        let mut trades = self.trades.lock().unwrap();

        for position in positions {
            let Some(trade) = trades.get_mut(&position.symbol) else {
                continue;
            };
            trade.record_excursion(position.unrealised_pnl);

            if self.cfg.drawdown_threshold > 0.0 && position.position_value > 0.0 {
                let margin = position.position_value / leverage;
                let pnl_pct = position.unrealised_pnl / margin * 100.0;
                if pnl_pct <= -self.cfg.drawdown_threshold {
                    self.cooldowns
                        .lock()
                        .unwrap()
                        .arm(&position.symbol, self.cfg.stop_loss_timeout);
                    warn!(
                        "{}: drawdown {:.2}% past the {:.2}% threshold, cooling down",
                        position.symbol, pnl_pct, self.cfg.drawdown_threshold
                    );
                }
            }
        }
    }

    /// Pick up a live position the table does not know about (restart,
    /// manual entry). `per_order_notional` is the configured single-order
    /// value for the pair, used to estimate how many averaging fills the
    /// position already absorbed. Returns false when already tracked.
    pub fn adopt_position(&self, position: &PositionInfo, per_order_notional: Option<f64>) -> bool {
        let mut trades = self.trades.lock().unwrap();
        if trades.contains(&position.symbol) {
            return false;
        }
        let mut trade = Trade::open(
            &position.symbol,
            position.side,
            position.avg_price,
            position.size,
            0.0,
        );
        if let Some(per_order) = per_order_notional.filter(|v| *v > 0.0) {
            let fills = (position.position_value / per_order).round() as i64;
            trade.dca_count = (fills - 1).max(0) as u32;
        }
        trade.record_excursion(position.unrealised_pnl.min(0.0));
        trades.insert(trade);
        info!(
            "{}: adopted live {} position of {} @ {}",
            position.symbol,
            position.side.direction(),
            position.size,
            position.avg_price
        );
        true
    }

    /// Drop trade records whose position no longer exists on the exchange
    /// (closed externally). Returns the pruned symbols.
    pub fn prune_closed(&self, live: &[PositionInfo]) -> Vec<String> {
        let live_symbols: HashSet<&str> = live
            .iter()
            .filter(|p| p.size > 0.0)
            .map(|p| p.symbol.as_str())
            .collect();

        let mut trades = self.trades.lock().unwrap();
        let stale: Vec<String> = trades
            .symbols()
            .into_iter()
            .filter(|s| !live_symbols.contains(s.as_str()))
            .collect();
        for symbol in &stale {
            trades.remove(symbol);
            info!("{}: position closed externally, dropping trade record", symbol);
        }
        stale
    }
}
