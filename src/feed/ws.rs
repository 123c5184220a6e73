//! Websocket transport for the liquidation and order feeds, with automatic
//! reconnection and keepalive pings.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::models::{FeedEvent, FeedSource};

#[derive(Debug, Clone)]
pub struct WsFeedConfig {
    pub url: String,
    pub source: FeedSource,
    /// Topics sent in a subscribe frame on connect; empty when the URL
    /// itself selects the stream (Binance style)
    pub subscriptions: Vec<String>,
    pub ping_interval: Duration,
    pub reconnect_delay: Duration,
}

impl WsFeedConfig {
    pub fn new(url: impl Into<String>, source: FeedSource) -> Self {
        Self {
            url: url.into(),
            source,
            subscriptions: Vec::new(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
        }
    }

    pub fn with_subscriptions(mut self, topics: Vec<String>) -> Self {
        self.subscriptions = topics;
        self
    }
}

/// Spawn the connection loop. Events land on `tx`; the task exits when the
/// receiving side is dropped.
pub fn spawn(config: WsFeedConfig, tx: mpsc::Sender<FeedEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_feed_loop(config, tx))
}

async fn run_feed_loop(config: WsFeedConfig, tx: mpsc::Sender<FeedEvent>) {
    info!("Starting {} feed at {}", config.source, config.url);

    loop {
        match connect_async(&config.url).await {
            Ok((stream, _)) => {
                info!("{} feed connected", config.source);
                if !read_until_disconnect(&config, stream, &tx).await {
                    return;
                }
                warn!("{} feed disconnected", config.source);
            }
            Err(e) => {
                warn!("{} feed connect failed: {}", config.source, e);
            }
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// Returns false when the event channel is gone and the loop should stop.
async fn read_until_disconnect(
    config: &WsFeedConfig,
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tx: &mpsc::Sender<FeedEvent>,
) -> bool {
    let (mut write, mut read) = stream.split();

    if !config.subscriptions.is_empty() {
        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": config.subscriptions,
        });
        if let Err(e) = write.send(Message::Text(subscribe.to_string().into())).await {
            warn!("{} subscribe failed: {}", config.source, e);
            return true;
        }
        debug!(
            "{} subscribed to {} topic(s)",
            config.source,
            config.subscriptions.len()
        );
    }

    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Ping(vec![].into())).await.is_err() {
                    return true;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let events = match config.source {
                        FeedSource::Bybit => super::parse_bybit(text.as_str()),
                        FeedSource::Binance => super::parse_binance(text.as_str()),
                    };
                    for event in events {
                        if tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("{} feed read error: {}", config.source, e);
                    return true;
                }
            }
        }
    }
}
