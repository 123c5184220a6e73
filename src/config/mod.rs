use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Which liquidation feeds to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSelection {
    Bybit,
    Binance,
    /// Both providers, merged into one bucket space
    Both,
}

impl FeedSelection {
    pub fn wants_bybit(self) -> bool {
        matches!(self, FeedSelection::Bybit | FeedSelection::Both)
    }

    pub fn wants_binance(self) -> bool {
        matches!(self, FeedSelection::Binance | FeedSelection::Both)
    }
}

/// How DCA entries are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcaMode {
    /// Ladder of resting limit orders placed at entry time
    AverageEntries,
    /// Market adds triggered by further adverse liquidations
    Liquidations,
}

/// Bot configuration, read once from the environment at startup.
///
/// Live-tunable per-pair values (order size, price bounds) live in the
/// settings file instead, see [`SettingsStore`].
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub api_key: String,
    pub api_secret: String,
    pub rest_url: String,

    pub min_liquidation_volume: f64,
    pub max_open_positions: usize,
    pub leverage: f64,

    pub use_take_profit: bool,
    pub take_profit_pct: f64,
    pub use_stop_loss: bool,
    pub stop_loss_pct: f64,

    pub use_stop_loss_timeout: bool,
    pub stop_loss_timeout: Duration,
    /// 0.0 disables the drawdown-based cooldown
    pub drawdown_threshold: f64,

    pub use_dca: bool,
    pub dca_mode: DcaMode,
    pub dca_safety_orders: u32,
    pub dca_price_deviation_pct: f64,
    pub dca_volume_scale: f64,

    pub sequential_dispatch: bool,
    pub feed_selection: FeedSelection,
    pub merge_feed_sources: bool,
    pub bybit_ws_url: String,
    pub binance_ws_url: String,

    pub blocklist: Vec<String>,
    pub allowlist: Vec<String>,
    pub use_allowlist: bool,
    pub paused_symbols: Vec<String>,

    pub side_balance: bool,
    /// 0.0 disables the volatility filter
    pub volatility_threshold_pct: f64,
    pub volatility_period: u32,
    pub percent_order_size: f64,
    pub recalc_sl_tp: bool,

    pub webhook_url: Option<String>,
    pub stats_path: PathBuf,
    pub settings_path: PathBuf,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_str("API_KEY", ""),
            api_secret: env_str("API_SECRET", ""),
            rest_url: env_str("REST_URL", "https://api.bybit.com"),

            min_liquidation_volume: env_f64("MIN_LIQUIDATION_VOLUME", 10_000.0),
            max_open_positions: env_f64("MAX_OPEN_POSITIONS", 5.0) as usize,
            leverage: env_f64("LEVERAGE", 10.0),

            use_take_profit: env_bool("USE_TAKE_PROFIT", true),
            take_profit_pct: env_f64("TAKE_PROFIT_PERCENT", 1.0),
            use_stop_loss: env_bool("USE_STOPLOSS", true),
            stop_loss_pct: env_f64("STOP_LOSS_PERCENT", 5.0),

            use_stop_loss_timeout: env_bool("USE_STOP_LOSS_TIMEOUT", true),
            stop_loss_timeout: Duration::from_millis(env_f64("STOP_LOSS_TIMEOUT", 300_000.0) as u64),
            drawdown_threshold: env_f64("DRAWDOWN_THRESHOLD", 0.0),

            use_dca: env_bool("USE_DCA_FEATURE", false),
            dca_mode: match env_str("DCA_TYPE", "DCA_LIQUIDATIONS").as_str() {
                "DCA_AVERAGE_ENTRIES" => DcaMode::AverageEntries,
                _ => DcaMode::Liquidations,
            },
            dca_safety_orders: env_f64("DCA_SAFETY_ORDERS", 3.0) as u32,
            dca_price_deviation_pct: env_f64("DCA_PRICE_DEVIATION_PRC", 1.0),
            dca_volume_scale: env_f64("DCA_VOLUME_SCALE", 1.0),

            sequential_dispatch: env_bool("PLACE_ORDERS_SEQUENTIALLY", true),
            feed_selection: match env_str("LIQ_SOURCE", "bybit").to_lowercase().as_str() {
                "binance" => FeedSelection::Binance,
                "both" => FeedSelection::Both,
                _ => FeedSelection::Bybit,
            },
            merge_feed_sources: env_str("LIQ_SOURCE", "bybit").to_lowercase() == "both",
            bybit_ws_url: env_str("BYBIT_WS_URL", "wss://stream.bybit.com/v5/public/linear"),
            binance_ws_url: env_str(
                "BINANCE_WS_URL",
                "wss://fstream.binance.com/ws/!forceOrder@arr",
            ),

            blocklist: env_csv("BLACKLIST"),
            allowlist: env_csv("WHITELIST"),
            use_allowlist: env_bool("USE_WHITELIST", false),
            paused_symbols: env_csv("PAUSED_LIST"),

            side_balance: env_bool("TRADE_POSITIONS_SIDE_BALANCE", false),
            volatility_threshold_pct: env_f64("FILTER_CHECK_VOLATILITY_PRC", 0.0),
            volatility_period: env_f64("FILTER_CHECK_VOLATILITY_PERIOD", 15.0) as u32,
            percent_order_size: env_f64("PERCENT_ORDER_SIZE", 1.0),
            recalc_sl_tp: env_bool("USE_RECALC_SL_TP", false),

            webhook_url: std::env::var("WEBHOOK_URL").ok().filter(|v| !v.is_empty()),
            stats_path: PathBuf::from(env_str("STATS_PATH", "global_stats.json")),
            settings_path: PathBuf::from(env_str("SETTINGS_PATH", "settings.json")),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| parse_csv(&v))
        .unwrap_or_default()
}

/// Comma-separated list with whitespace tolerance ("A, B ,C" -> [A, B, C])
pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Per-symbol trade parameters from the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSettings {
    pub symbol: String,
    pub order_size: f64,
    pub max_position_size: f64,
    /// Buy-side liquidations printing at or above this are stale, skip entry
    pub long_price: f64,
    /// Sell-side liquidations printing at or below this are stale, skip entry
    pub short_price: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    pairs: Vec<PairSettings>,
}

/// Settings file with a refresh gate: re-read from disk at most once per
/// refresh interval. Consumers must tolerate values changing between reads.
pub struct SettingsStore {
    path: PathBuf,
    refresh_every: Duration,
    inner: Mutex<StoreState>,
}

struct StoreState {
    loaded_at: Option<Instant>,
    file: SettingsFile,
}

impl SettingsStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_refresh(path, Duration::from_secs(300))
    }

    pub fn with_refresh(path: impl AsRef<Path>, refresh_every: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            refresh_every,
            inner: Mutex::new(StoreState {
                loaded_at: None,
                file: SettingsFile::default(),
            }),
        }
    }

    /// Look up a symbol's pair settings, reloading the file if stale.
    /// None means the symbol is not configured for trading.
    pub fn pair(&self, symbol: &str) -> Option<PairSettings> {
        let state = self.fresh_state();
        state.file.pairs.iter().find(|p| p.symbol == symbol).cloned()
    }

    /// Every configured symbol, for feed subscriptions
    pub fn symbols(&self) -> Vec<String> {
        let state = self.fresh_state();
        state.file.pairs.iter().map(|p| p.symbol.clone()).collect()
    }

    fn fresh_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        let mut state = self.inner.lock().unwrap();
        let stale = state
            .loaded_at
            .map(|t| t.elapsed() >= self.refresh_every)
            .unwrap_or(true);

        if stale {
            match std::fs::read_to_string(&self.path) {
                Ok(raw) => match serde_json::from_str::<SettingsFile>(&raw) {
                    Ok(file) => {
                        state.file = file;
                        state.loaded_at = Some(Instant::now());
                    }
                    Err(e) => {
                        tracing::warn!("Settings file {:?} unparsable: {}", self.path, e);
                        state.loaded_at = Some(Instant::now());
                    }
                },
                Err(e) => {
                    tracing::warn!("Settings file {:?} unreadable: {}", self.path, e);
                    state.loaded_at = Some(Instant::now());
                }
            }
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_csv_trims_and_drops_empty() {
        assert_eq!(
            parse_csv(" BTCUSDT, ETHUSDT ,,XRPUSDT"),
            vec!["BTCUSDT", "ETHUSDT", "XRPUSDT"]
        );
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn test_settings_store_missing_file() {
        let store = SettingsStore::new("/nonexistent/settings.json");
        assert!(store.pair("BTCUSDT").is_none());
    }

    #[test]
    fn test_settings_store_reads_pairs() {
        let dir = std::env::temp_dir().join("liqbot-settings-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(
            &path,
            r#"{"pairs":[{"symbol":"XYZUSDT","order_size":10.0,
                "max_position_size":100.0,"long_price":2.5,"short_price":1.5}]}"#,
        )
        .unwrap();

        let store = SettingsStore::new(&path);
        let pair = store.pair("XYZUSDT").unwrap();
        assert_eq!(pair.order_size, 10.0);
        assert_eq!(pair.long_price, 2.5);
        assert!(store.pair("OTHERUSDT").is_none());

        std::fs::remove_file(&path).ok();
    }
}
