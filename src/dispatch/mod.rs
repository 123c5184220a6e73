//! Serialized signal dispatch.
//!
//! Signals are not traded straight off the feed. They queue up here and are
//! drained one per tick so order placement never bursts against the exchange
//! rate limits, and a failing symbol never takes the loop down with it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::models::LiquidationSignal;

/// Interval between dispatch ticks. One queued signal is handled per tick.
pub const DRAIN_INTERVAL_MS: u64 = 100;

#[derive(Default)]
pub struct DispatchQueue {
    inner: Mutex<VecDeque<LiquidationSignal>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a signal unless one for the same symbol is already waiting.
    /// Returns false when the signal was dropped as a duplicate.
    pub fn push(&self, signal: LiquidationSignal) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if queue.iter().any(|queued| queued.symbol == signal.symbol) {
            return false;
        }
        queue.push_back(signal);
        true
    }

    pub fn pop(&self) -> Option<LiquidationSignal> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Drain loop: one signal per tick, errors logged and swallowed so the next
/// signal still runs.
pub async fn run(queue: Arc<DispatchQueue>, engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_millis(DRAIN_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let Some(signal) = queue.pop() else {
            continue;
        };
        dispatch_one(&engine, signal).await;
    }
}

/// Handle a single signal. The engine never lets a failure escape as an
/// error; every outcome comes back as a loggable disposition.
pub async fn dispatch_one(engine: &Engine, signal: LiquidationSignal) {
    let symbol = signal.symbol.clone();
    let disposition = engine.handle_signal(signal).await;
    info!("{}: {}", symbol, disposition);
}

/// Route a fresh signal. Sequential mode queues it for the drain loop;
/// otherwise the decision runs on its own task immediately, concurrently
/// with whatever else is in flight, and the caller never waits on it.
pub fn submit(
    queue: &Arc<DispatchQueue>,
    engine: &Arc<Engine>,
    sequential: bool,
    signal: LiquidationSignal,
) {
    if sequential {
        if !queue.push(signal) {
            warn!("duplicate signal dropped, symbol already queued");
        }
    } else {
        let engine = engine.clone();
        tokio::spawn(async move {
            dispatch_one(&engine, signal).await;
        });
    }
}
