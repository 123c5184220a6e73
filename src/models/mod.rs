use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side as the exchange understands it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Human direction label ("Long"/"Short") used in log lines
    pub fn direction(self) -> &'static str {
        match self {
            Side::Buy => "Long",
            Side::Sell => "Short",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "Buy"),
            Side::Sell => write!(f, "Sell"),
        }
    }
}

/// Why an order exists, as reported by the exchange on fills.
///
/// Modeled as a closed set instead of raw strings so the lifecycle can
/// branch exhaustively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    CreateByUser,
    StopLoss,
    TakeProfit,
}

impl CloseReason {
    /// Parse the wire string; unknown values map to None and are skipped
    pub fn from_wire(raw: &str) -> Option<CloseReason> {
        match raw {
            "CreateByUser" => Some(CloseReason::CreateByUser),
            "StopLoss" => Some(CloseReason::StopLoss),
            "TakeProfit" => Some(CloseReason::TakeProfit),
            _ => None,
        }
    }

    pub fn is_close(self) -> bool {
        matches!(self, CloseReason::StopLoss | CloseReason::TakeProfit)
    }
}

/// Which upstream feed produced a liquidation event.
///
/// Labeling only: buckets are keyed by symbol, never by source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedSource {
    Bybit,
    Binance,
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedSource::Bybit => write!(f, "Bybit"),
            FeedSource::Binance => write!(f, "Binance"),
        }
    }
}

/// A normalized forced-liquidation event. `qty` is already quote notional
/// (contracts * price).
#[derive(Debug, Clone)]
pub struct LiquidationEvent {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    pub source: FeedSource,
}

/// Fill/status notification from the order channel
#[derive(Debug, Clone)]
pub struct OrderUpdateEvent {
    pub symbol: String,
    pub side: Side,
    pub order_status: String,
    pub create_type: Option<CloseReason>,
    /// Newer payloads report the reason here instead of `create_type`
    pub close_type: Option<CloseReason>,
    pub last_exec_price: f64,
    pub qty: f64,
}

impl OrderUpdateEvent {
    pub fn is_filled(&self) -> bool {
        self.order_status == "Filled"
    }

    /// Reason for the fill. `close_type` wins when both fields are present.
    pub fn resolved_reason(&self) -> Option<CloseReason> {
        self.close_type.or(self.create_type)
    }
}

/// Notification from the stop-order channel (conditional orders)
#[derive(Debug, Clone)]
pub struct StopOrderEvent {
    pub symbol: String,
    pub order_status: String,
    pub stop_order_type: Option<CloseReason>,
}

/// Everything the streaming feed can deliver
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Liquidation(LiquidationEvent),
    OrderUpdates(Vec<OrderUpdateEvent>),
    StopOrder(StopOrderEvent),
}

/// Actionable output of the aggregator. Immutable once emitted; consumed
/// exactly once by the dispatch queue.
#[derive(Debug, Clone)]
pub struct LiquidationSignal {
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub cumulative_qty: f64,
    pub event_count: u32,
    pub window_started_at: DateTime<Utc>,
    pub source: FeedSource,
}

/// Round to `dp` decimal places (prices to tick decimals, notionals to 2)
pub fn round_dp(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_dp() {
        assert_eq!(round_dp(12.3456, 2), 12.35);
        assert_eq!(round_dp(12.3449, 2), 12.34);
        assert_eq!(round_dp(2.0004, 3), 2.0);
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_close_reason_from_wire() {
        assert_eq!(
            CloseReason::from_wire("StopLoss"),
            Some(CloseReason::StopLoss)
        );
        assert_eq!(
            CloseReason::from_wire("CreateByUser"),
            Some(CloseReason::CreateByUser)
        );
        assert_eq!(CloseReason::from_wire("Adl"), None);
    }

    #[test]
    fn test_resolved_reason_prefers_close_type() {
        let update = OrderUpdateEvent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            order_status: "Filled".to_string(),
            create_type: Some(CloseReason::CreateByUser),
            close_type: Some(CloseReason::TakeProfit),
            last_exec_price: 50_000.0,
            qty: 0.1,
        };
        assert_eq!(update.resolved_reason(), Some(CloseReason::TakeProfit));

        let legacy = OrderUpdateEvent {
            close_type: None,
            ..update
        };
        assert_eq!(legacy.resolved_reason(), Some(CloseReason::CreateByUser));
    }

    #[test]
    fn test_close_reason_is_close() {
        assert!(CloseReason::StopLoss.is_close());
        assert!(CloseReason::TakeProfit.is_close());
        assert!(!CloseReason::CreateByUser.is_close());
    }
}
