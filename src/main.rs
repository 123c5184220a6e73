use liqbot::aggregator::CooldownMap;
use liqbot::config::{BotConfig, SettingsStore};
use liqbot::dispatch::{self, DispatchQueue};
use liqbot::engine::Engine;
use liqbot::exchange::ExchangeClient;
use liqbot::feed::{self, ws, FeedRouter};
use liqbot::models::FeedSource;
use liqbot::notify::{Notifier, NullNotifier, WebhookNotifier};
use liqbot::reconcile::Reconciler;
use liqbot::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const FEED_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 LiqBot starting - liquidation-reactive trading");

    let cfg = BotConfig::from_env();
    if cfg.api_key.is_empty() || cfg.api_secret.is_empty() {
        return Err("API_KEY and API_SECRET must be set in the environment".into());
    }

    let client = Arc::new(
        ExchangeClient::new(
            cfg.rest_url.clone(),
            cfg.api_key.clone(),
            cfg.api_secret.clone(),
        )
        .with_throttle_callback(
            || {
                tracing::error!("💀 Exchange rate limit exceeded, terminating");
                std::process::exit(4);
            },
        ),
    );

    let cooldowns = Arc::new(Mutex::new(CooldownMap::new()));
    let settings = Arc::new(SettingsStore::new(&cfg.settings_path));
    let notifier: Arc<dyn Notifier> = match cfg.webhook_url.clone() {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => Arc::new(NullNotifier),
    };

    let engine = Arc::new(Engine::new(
        cfg.clone(),
        client.clone(),
        settings.clone(),
        notifier,
        cooldowns.clone(),
    ));

    // One-way position mode; "not modified" is the normal answer on restart
    if let Err(e) = client.switch_position_mode(0).await {
        if !e.is_noop() {
            tracing::warn!("Position mode switch failed: {}", e);
        }
    }

    let symbols = settings.symbols();

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Min liquidation volume: {} USDT", cfg.min_liquidation_volume);
    tracing::info!("  Max open positions: {}", cfg.max_open_positions);
    tracing::info!("  Leverage: {}x", cfg.leverage);
    tracing::info!(
        "  TP {}% / SL {}% (timeout {:?})",
        cfg.take_profit_pct,
        cfg.stop_loss_pct,
        cfg.stop_loss_timeout
    );
    tracing::info!("  DCA: {} ({:?})", cfg.use_dca, cfg.dca_mode);
    tracing::info!("  Feed: {:?}", cfg.feed_selection);
    tracing::info!("  Pairs configured: {}", symbols.len());

    tracing::info!("\n🔄 Spawning independent loops...");

    let (feed_tx, feed_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
    if cfg.feed_selection.wants_bybit() {
        let mut topics: Vec<String> = symbols
            .iter()
            .map(|s| format!("liquidation.{}", s))
            .collect();
        topics.push("order".to_string());
        topics.push("stopOrder".to_string());
        ws::spawn(
            ws::WsFeedConfig::new(cfg.bybit_ws_url.clone(), FeedSource::Bybit)
                .with_subscriptions(topics),
            feed_tx.clone(),
        );
    }
    if cfg.feed_selection.wants_binance() {
        ws::spawn(
            ws::WsFeedConfig::new(cfg.binance_ws_url.clone(), FeedSource::Binance),
            feed_tx.clone(),
        );
    }
    drop(feed_tx);

    let queue = Arc::new(DispatchQueue::new());
    let router = FeedRouter::new(&cfg, cooldowns.clone());

    // Loop 1: feed ingestion (aggregation -> dispatch/queue)
    let ingest_task = {
        let queue = queue.clone();
        let engine = engine.clone();
        let sequential = cfg.sequential_dispatch;
        tokio::spawn(async move {
            feed::run(feed_rx, router, queue, engine, sequential).await;
        })
    };

    // Loop 2: dispatch drain (one queued signal per tick)
    let drain_task = {
        let queue = queue.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            dispatch::run(queue, engine).await;
        })
    };

    // Loop 3: reconciliation/valuation, paced by the adaptive delay
    let reconcile_task = {
        let reconciler = Arc::new(Reconciler::new(
            cfg.clone(),
            client.clone(),
            engine.clone(),
            settings,
        ));
        tokio::spawn(async move {
            reconciler.run().await;
        })
    };

    tracing::info!("✅ All loops spawned successfully");
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");
        }
        result = ingest_task => {
            tracing::error!("Feed ingest loop exited: {:?}", result);
        }
        result = drain_task => {
            tracing::error!("Dispatch drain loop exited: {:?}", result);
        }
        result = reconcile_task => {
            tracing::error!("Reconciliation loop exited: {:?}", result);
        }
    }

    tracing::info!("👋 LiqBot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "liqbot=info".to_string()),
        )
        .init();
}
