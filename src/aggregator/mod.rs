//! Liquidation window aggregation and per-symbol cooldowns.
//!
//! Single liquidation events are rarely tradable on their own. A cascade is:
//! we bucket events per symbol and accumulate notional volume inside a short
//! rolling window, emitting a signal only once the window total clears the
//! configured minimum.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::models::{round_dp, LiquidationEvent, LiquidationSignal};

/// Events further apart than this do not belong to the same cascade.
pub const WINDOW_MS: i64 = 5_000;

/// Symbols that recently hit a stop loss, kept out of re-entry until their
/// timeout lapses. Another stop on the same symbol restarts the clock.
#[derive(Debug, Default)]
pub struct CooldownMap {
    deadlines: HashMap<String, Instant>,
}

pub type SharedCooldowns = Arc<Mutex<CooldownMap>>;

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the cooldown for a symbol.
    pub fn arm(&mut self, symbol: &str, timeout: Duration) {
        self.arm_at(symbol, timeout, Instant::now());
    }

    pub fn arm_at(&mut self, symbol: &str, timeout: Duration, now: Instant) {
        self.deadlines.insert(symbol.to_string(), now + timeout);
    }

    pub fn is_cooling(&mut self, symbol: &str) -> bool {
        self.is_cooling_at(symbol, Instant::now())
    }

    pub fn is_cooling_at(&mut self, symbol: &str, now: Instant) -> bool {
        match self.deadlines.get(symbol) {
            Some(deadline) if now < *deadline => true,
            Some(_) => {
                self.deadlines.remove(symbol);
                false
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    side: crate::models::Side,
    last_price: f64,
    cumulative_qty: f64,
    event_count: u32,
    window_started_at: DateTime<Utc>,
    last_event_at: DateTime<Utc>,
}

/// Accumulates liquidation events per symbol and emits trade signals.
pub struct LiquidationAggregator {
    buckets: HashMap<String, Bucket>,
    min_volume: f64,
    blocklist: HashSet<String>,
    allowlist: HashSet<String>,
    use_allowlist: bool,
    use_cooldown: bool,
    cooldowns: SharedCooldowns,
}

impl LiquidationAggregator {
    pub fn new(
        min_volume: f64,
        blocklist: &[String],
        allowlist: &[String],
        use_allowlist: bool,
        use_cooldown: bool,
        cooldowns: SharedCooldowns,
    ) -> Self {
        Self {
            buckets: HashMap::new(),
            min_volume,
            blocklist: blocklist.iter().cloned().collect(),
            allowlist: allowlist.iter().cloned().collect(),
            use_allowlist,
            use_cooldown,
            cooldowns,
        }
    }

    /// Fold one liquidation event into its symbol bucket. Returns a signal
    /// when the window total clears the minimum volume and the symbol is not
    /// cooling down after a recent stop loss.
    pub fn ingest(&mut self, event: &LiquidationEvent) -> Option<LiquidationSignal> {
        self.ingest_at(event, Utc::now())
    }

    pub fn ingest_at(
        &mut self,
        event: &LiquidationEvent,
        now: DateTime<Utc>,
    ) -> Option<LiquidationSignal> {
        if self.blocklist.contains(&event.symbol) {
            debug!("{} is blocklisted, ignoring liquidation", event.symbol);
            return None;
        }
        if self.use_allowlist && !self.allowlist.contains(&event.symbol) {
            debug!("{} not on allowlist, ignoring liquidation", event.symbol);
            return None;
        }

        let bucket = self
            .buckets
            .entry(event.symbol.clone())
            .and_modify(|b| {
                let gap = now.signed_duration_since(b.last_event_at);
                if gap.num_milliseconds() > WINDOW_MS {
                    // Stale window, this event starts a new cascade.
                    b.side = event.side;
                    b.last_price = event.price;
                    b.cumulative_qty = round_dp(event.qty, 2);
                    b.event_count = 1;
                    b.window_started_at = now;
                } else {
                    b.side = event.side;
                    b.last_price = event.price;
                    b.cumulative_qty = round_dp(b.cumulative_qty + event.qty, 2);
                    b.event_count += 1;
                }
                b.last_event_at = now;
            })
            .or_insert_with(|| Bucket {
                side: event.side,
                last_price: event.price,
                cumulative_qty: round_dp(event.qty, 2),
                event_count: 1,
                window_started_at: now,
                last_event_at: now,
            });

        if bucket.cumulative_qty <= self.min_volume {
            info!(
                "{} accumulating: {:.2} USDT over {} event(s), need > {:.2}",
                event.symbol, bucket.cumulative_qty, bucket.event_count, self.min_volume
            );
            return None;
        }

        if self.use_cooldown {
            let mut cooldowns = self.cooldowns.lock().unwrap();
            if cooldowns.is_cooling(&event.symbol) {
                info!(
                    "{} liquidation volume {:.2} USDT reached but symbol is cooling down",
                    event.symbol, bucket.cumulative_qty
                );
                return None;
            }
        }

        Some(LiquidationSignal {
            symbol: event.symbol.clone(),
            side: bucket.side,
            price: bucket.last_price,
            cumulative_qty: bucket.cumulative_qty,
            event_count: bucket.event_count,
            window_started_at: bucket.window_started_at,
            source: event.source,
        })
    }
}
