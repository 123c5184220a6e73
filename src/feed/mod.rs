//! Streaming-feed normalization and the ingest loop.
//!
//! The websocket transport ([`ws`]) pushes raw text frames through the
//! parsers here, which turn provider payload shapes into [`FeedEvent`]s.
//! The ingest loop routes them: liquidations through the aggregator(s)
//! into dispatch, order/stop updates straight to the engine.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::aggregator::{LiquidationAggregator, SharedCooldowns};
use crate::config::BotConfig;
use crate::dispatch::{self, DispatchQueue};
use crate::engine::Engine;
use crate::models::{
    CloseReason, FeedEvent, FeedSource, LiquidationEvent, LiquidationSignal, OrderUpdateEvent,
    Side, StopOrderEvent,
};

// ---- Bybit payload shapes ----

#[derive(Deserialize)]
struct BybitMessage {
    topic: Option<String>,
    data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitLiquidation {
    symbol: String,
    side: Side,
    size: String,
    price: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    symbol: String,
    side: Side,
    order_status: String,
    #[serde(default)]
    create_type: Option<String>,
    #[serde(default)]
    close_type: Option<String>,
    #[serde(default)]
    last_exec_price: String,
    #[serde(default)]
    qty: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitStopOrder {
    symbol: String,
    order_status: String,
    #[serde(default)]
    stop_order_type: Option<String>,
}

/// Parse one Bybit websocket frame. Unknown topics and malformed frames
/// yield no events.
pub fn parse_bybit(text: &str) -> Vec<FeedEvent> {
    let Ok(msg) = serde_json::from_str::<BybitMessage>(text) else {
        return Vec::new();
    };
    let (Some(topic), Some(data)) = (msg.topic, msg.data) else {
        return Vec::new();
    };

    if topic.starts_with("liquidation.") {
        let Ok(liq) = serde_json::from_value::<BybitLiquidation>(data) else {
            warn!("unparsable liquidation frame on {}", topic);
            return Vec::new();
        };
        let (Ok(price), Ok(size)) = (liq.price.parse::<f64>(), liq.size.parse::<f64>()) else {
            return Vec::new();
        };
        return vec![FeedEvent::Liquidation(LiquidationEvent {
            symbol: liq.symbol,
            side: liq.side,
            price,
            qty: size * price,
            source: FeedSource::Bybit,
        })];
    }

    if topic == "order" {
        let Ok(orders) = serde_json::from_value::<Vec<BybitOrder>>(data) else {
            warn!("unparsable order frame");
            return Vec::new();
        };
        let updates: Vec<OrderUpdateEvent> = orders
            .into_iter()
            .map(|o| OrderUpdateEvent {
                symbol: o.symbol,
                side: o.side,
                order_status: o.order_status,
                create_type: o.create_type.as_deref().and_then(CloseReason::from_wire),
                close_type: o.close_type.as_deref().and_then(CloseReason::from_wire),
                last_exec_price: o.last_exec_price.parse().unwrap_or(0.0),
                qty: o.qty.parse().unwrap_or(0.0),
            })
            .collect();
        return vec![FeedEvent::OrderUpdates(updates)];
    }

    if topic == "stopOrder" {
        let Ok(stops) = serde_json::from_value::<Vec<BybitStopOrder>>(data) else {
            warn!("unparsable stop-order frame");
            return Vec::new();
        };
        return stops
            .into_iter()
            .map(|s| {
                FeedEvent::StopOrder(StopOrderEvent {
                    symbol: s.symbol,
                    order_status: s.order_status,
                    stop_order_type: s
                        .stop_order_type
                        .as_deref()
                        .and_then(CloseReason::from_wire),
                })
            })
            .collect();
    }

    debug!("ignoring frame on topic {}", topic);
    Vec::new()
}

// ---- Binance payload shapes ----

#[derive(Deserialize)]
struct BinanceMessage {
    #[serde(rename = "e")]
    event: Option<String>,
    #[serde(rename = "o")]
    order: Option<BinanceForceOrder>,
}

#[derive(Deserialize)]
struct BinanceForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "p")]
    price: String,
}

/// Parse one Binance forced-order frame. Binance reports the liquidated
/// side, so it inverts: their BUY liquidation closes shorts, which for us
/// is a Sell cascade.
pub fn parse_binance(text: &str) -> Vec<FeedEvent> {
    let Ok(msg) = serde_json::from_str::<BinanceMessage>(text) else {
        return Vec::new();
    };
    if msg.event.as_deref() != Some("forceOrder") {
        return Vec::new();
    }
    let Some(order) = msg.order else {
        return Vec::new();
    };
    let (Ok(price), Ok(qty)) = (order.price.parse::<f64>(), order.qty.parse::<f64>()) else {
        return Vec::new();
    };
    let side = match order.side.as_str() {
        "BUY" => Side::Sell,
        "SELL" => Side::Buy,
        other => {
            warn!("unknown forced-order side {}", other);
            return Vec::new();
        }
    };
    vec![FeedEvent::Liquidation(LiquidationEvent {
        symbol: order.symbol,
        side,
        price,
        qty: qty * price,
        source: FeedSource::Binance,
    })]
}

// ---- routing ----

/// Routes liquidation events into aggregators: one shared bucket space when
/// sources are merged, one per provider otherwise.
pub struct FeedRouter {
    merge: bool,
    aggregators: HashMap<&'static str, LiquidationAggregator>,
}

impl FeedRouter {
    pub fn new(cfg: &BotConfig, cooldowns: SharedCooldowns) -> Self {
        let build = |cooldowns: SharedCooldowns| {
            LiquidationAggregator::new(
                cfg.min_liquidation_volume,
                &cfg.blocklist,
                &cfg.allowlist,
                cfg.use_allowlist,
                cfg.use_stop_loss_timeout,
                cooldowns,
            )
        };

        let mut aggregators = HashMap::new();
        if cfg.merge_feed_sources {
            aggregators.insert("merged", build(cooldowns));
        } else {
            aggregators.insert("bybit", build(cooldowns.clone()));
            aggregators.insert("binance", build(cooldowns));
        }
        Self {
            merge: cfg.merge_feed_sources,
            aggregators,
        }
    }

    pub fn ingest(&mut self, event: &LiquidationEvent) -> Option<LiquidationSignal> {
        let key = if self.merge {
            "merged"
        } else {
            match event.source {
                FeedSource::Bybit => "bybit",
                FeedSource::Binance => "binance",
            }
        };
        self.aggregators.get_mut(key)?.ingest(event)
    }
}

/// Ingest loop: consume normalized feed events until the channel closes.
pub async fn run(
    mut events: mpsc::Receiver<FeedEvent>,
    mut router: FeedRouter,
    queue: Arc<DispatchQueue>,
    engine: Arc<Engine>,
    sequential: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            FeedEvent::Liquidation(liquidation) => {
                if let Some(signal) = router.ingest(&liquidation) {
                    dispatch::submit(&queue, &engine, sequential, signal);
                }
            }
            FeedEvent::OrderUpdates(updates) => engine.handle_order_updates(updates).await,
            FeedEvent::StopOrder(stop) => engine.handle_stop_order(&stop),
        }
    }
    debug!("feed channel closed, ingest loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bybit_liquidation_notional() {
        let frame = serde_json::json!({
            "topic": "liquidation.XYZUSDT",
            "data": { "symbol": "XYZUSDT", "side": "Buy", "size": "2500", "price": "2.0" }
        })
        .to_string();

        let events = parse_bybit(&frame);
        assert_eq!(events.len(), 1);
        let FeedEvent::Liquidation(liq) = &events[0] else {
            panic!("expected a liquidation");
        };
        assert_eq!(liq.symbol, "XYZUSDT");
        assert_eq!(liq.side, Side::Buy);
        assert_eq!(liq.qty, 5_000.0);
        assert_eq!(liq.source, FeedSource::Bybit);
    }

    #[test]
    fn test_parse_bybit_order_updates() {
        let frame = serde_json::json!({
            "topic": "order",
            "data": [{
                "symbol": "XYZUSDT",
                "side": "Sell",
                "orderStatus": "Filled",
                "createType": "CreateByUser",
                "closeType": "TakeProfit",
                "lastExecPrice": "2.04",
                "qty": "10"
            }]
        })
        .to_string();

        let events = parse_bybit(&frame);
        let FeedEvent::OrderUpdates(updates) = &events[0] else {
            panic!("expected order updates");
        };
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_filled());
        assert_eq!(updates[0].resolved_reason(), Some(CloseReason::TakeProfit));
        assert_eq!(updates[0].last_exec_price, 2.04);
    }

    #[test]
    fn test_parse_bybit_stop_order() {
        let frame = serde_json::json!({
            "topic": "stopOrder",
            "data": [{
                "symbol": "XYZUSDT",
                "orderStatus": "Triggered",
                "stopOrderType": "StopLoss"
            }]
        })
        .to_string();

        let events = parse_bybit(&frame);
        let FeedEvent::StopOrder(stop) = &events[0] else {
            panic!("expected a stop order");
        };
        assert_eq!(stop.stop_order_type, Some(CloseReason::StopLoss));
    }

    #[test]
    fn test_parse_bybit_garbage_yields_nothing() {
        assert!(parse_bybit("not json").is_empty());
        assert!(parse_bybit(r#"{"success":true,"op":"subscribe"}"#).is_empty());
    }

    #[test]
    fn test_parse_binance_inverts_side() {
        let frame = serde_json::json!({
            "e": "forceOrder",
            "o": { "s": "XYZUSDT", "S": "BUY", "q": "1000", "p": "2.0" }
        })
        .to_string();

        let events = parse_binance(&frame);
        let FeedEvent::Liquidation(liq) = &events[0] else {
            panic!("expected a liquidation");
        };
        // their BUY closes shorts: a Sell cascade for us
        assert_eq!(liq.side, Side::Sell);
        assert_eq!(liq.qty, 2_000.0);
        assert_eq!(liq.source, FeedSource::Binance);
    }

    #[test]
    fn test_parse_binance_ignores_other_events() {
        assert!(parse_binance(r#"{"e":"aggTrade"}"#).is_empty());
    }

    #[test]
    fn test_router_keeps_sources_apart_when_not_merging() {
        use crate::aggregator::CooldownMap;
        use std::sync::Mutex;

        let mut cfg = crate::config::BotConfig::from_env();
        cfg.min_liquidation_volume = 10_000.0;
        cfg.merge_feed_sources = false;
        cfg.blocklist = vec![];
        cfg.allowlist = vec![];
        cfg.use_allowlist = false;

        let cooldowns = Arc::new(Mutex::new(CooldownMap::new()));
        let mut router = FeedRouter::new(&cfg, cooldowns);

        let bybit = LiquidationEvent {
            symbol: "XYZUSDT".to_string(),
            side: Side::Buy,
            price: 2.0,
            qty: 6_000.0,
            source: FeedSource::Bybit,
        };
        let binance = LiquidationEvent {
            source: FeedSource::Binance,
            ..bybit.clone()
        };

        // 6k + 6k would cross the 10k threshold only if buckets merged
        assert!(router.ingest(&bybit).is_none());
        assert!(router.ingest(&binance).is_none());
        assert!(router.ingest(&bybit).is_some());
    }
}
