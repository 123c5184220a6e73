use crate::models::{CloseReason, Side};

/// One open position's lifecycle record. Created on a confirmed entry fill,
/// mutated on averaging fills and valuation ticks, removed on close.
#[derive(Debug, Clone)]
pub struct Trade {
    pub symbol: String,
    pub side: Side,
    /// Fill price of the original entry
    pub start_price: f64,
    /// Volume-weighted entry across the original fill and averaging fills
    pub averaged_price: f64,
    /// Position size in base units
    pub size: f64,
    pub dca_count: u32,
    /// Worst unrealized P&L observed while open, <= 0
    pub max_adverse_excursion: f64,
    /// Set when a close is already known (stop-order trigger) before the
    /// fill notification arrives
    pub close_type: Option<CloseReason>,
    /// Notional of the liquidation cascade that opened this trade
    pub liquidity_trigger: f64,
}

impl Trade {
    pub fn open(symbol: &str, side: Side, fill_price: f64, size: f64, trigger: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            start_price: fill_price,
            averaged_price: fill_price,
            size,
            dca_count: 0,
            max_adverse_excursion: 0.0,
            close_type: None,
            liquidity_trigger: trigger,
        }
    }

    /// Fold an averaging fill into the position
    pub fn average(&mut self, fill_price: f64, fill_qty: f64) {
        let total = self.size + fill_qty;
        if total > 0.0 {
            self.averaged_price =
                (self.averaged_price * self.size + fill_price * fill_qty) / total;
        }
        self.size = total;
        self.dca_count += 1;
    }

    /// Tighten the worst-loss watermark; never loosens
    pub fn record_excursion(&mut self, unrealized_pnl: f64) {
        if unrealized_pnl < self.max_adverse_excursion {
            self.max_adverse_excursion = unrealized_pnl;
        }
    }

    /// Close reason for a fill. A reason already recorded on the trade wins
    /// over whatever the order payload reports, absorbing upstream
    /// reclassification of closes we have already seen trigger.
    pub fn resolved_close(&self, reported: Option<CloseReason>) -> Option<CloseReason> {
        self.close_type.or(reported)
    }
}

/// Active-trade table: the single source of truth for "is a position open".
/// At most one trade per symbol, enforced at insertion.
#[derive(Debug, Default)]
pub struct TradeTable {
    trades: std::collections::HashMap<String, Trade>,
}

impl TradeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly opened trade. Returns false (and leaves the table
    /// unchanged) when the symbol already has one.
    pub fn insert(&mut self, trade: Trade) -> bool {
        if self.trades.contains_key(&trade.symbol) {
            return false;
        }
        self.trades.insert(trade.symbol.clone(), trade);
        true
    }

    pub fn get(&self, symbol: &str) -> Option<&Trade> {
        self.trades.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Trade> {
        self.trades.get_mut(symbol)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Trade> {
        self.trades.remove(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.trades.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn count_side(&self, side: Side) -> usize {
        self.trades.values().filter(|t| t.side == side).count()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.trades.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.trades.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_reweights_entry_price() {
        let mut trade = Trade::open("XYZUSDT", Side::Buy, 2.0, 10.0, 50_000.0);
        trade.average(1.8, 10.0);

        assert_eq!(trade.averaged_price, 1.9);
        assert_eq!(trade.size, 20.0);
        assert_eq!(trade.dca_count, 1);
        // original entry is preserved
        assert_eq!(trade.start_price, 2.0);
    }

    #[test]
    fn test_excursion_only_tightens() {
        let mut trade = Trade::open("XYZUSDT", Side::Buy, 2.0, 10.0, 50_000.0);
        trade.record_excursion(-5.0);
        trade.record_excursion(-2.0);
        assert_eq!(trade.max_adverse_excursion, -5.0);
        trade.record_excursion(-8.5);
        assert_eq!(trade.max_adverse_excursion, -8.5);
    }

    #[test]
    fn test_resolved_close_prefers_recorded_type() {
        let mut trade = Trade::open("XYZUSDT", Side::Buy, 2.0, 10.0, 50_000.0);
        assert_eq!(
            trade.resolved_close(Some(CloseReason::TakeProfit)),
            Some(CloseReason::TakeProfit)
        );

        trade.close_type = Some(CloseReason::StopLoss);
        assert_eq!(
            trade.resolved_close(Some(CloseReason::CreateByUser)),
            Some(CloseReason::StopLoss)
        );
    }

    #[test]
    fn test_table_rejects_second_trade_for_symbol() {
        let mut table = TradeTable::new();
        assert!(table.insert(Trade::open("XYZUSDT", Side::Buy, 2.0, 10.0, 0.0)));
        assert!(!table.insert(Trade::open("XYZUSDT", Side::Sell, 2.1, 5.0, 0.0)));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("XYZUSDT").unwrap().side, Side::Buy);
    }

    #[test]
    fn test_count_side() {
        let mut table = TradeTable::new();
        table.insert(Trade::open("AUSDT", Side::Buy, 1.0, 1.0, 0.0));
        table.insert(Trade::open("BUSDT", Side::Buy, 1.0, 1.0, 0.0));
        table.insert(Trade::open("CUSDT", Side::Sell, 1.0, 1.0, 0.0));
        assert_eq!(table.count_side(Side::Buy), 2);
        assert_eq!(table.count_side(Side::Sell), 1);
    }
}
