use crate::models::Side;
use serde::{Deserialize, Serialize};

/// Envelope every REST endpoint answers with. `ret_code == 0` is success;
/// `rate_limit_ratio` is the server's remaining-quota ratio (0..1) when it
/// chooses to report one.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestResponse<T> {
    pub ret_code: i64,
    #[serde(default)]
    pub ret_msg: String,
    pub result: Option<T>,
    #[serde(default)]
    pub rate_limit_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResult<T> {
    pub list: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub avg_price: f64,
    pub mark_price: f64,
    pub unrealised_pnl: f64,
    #[serde(default)]
    pub stop_loss: f64,
    #[serde(default)]
    pub take_profit: f64,
    pub position_value: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletBalance {
    pub available_balance: f64,
    pub used_margin: f64,
}

impl WalletBalance {
    pub fn whole_balance(&self) -> f64 {
        self.available_balance + self.used_margin
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentInfo {
    pub symbol: String,
    pub tick_size: f64,
    pub min_order_qty: f64,
}

impl InstrumentInfo {
    /// Decimal places implied by the tick size (0.001 -> 3)
    pub fn tick_decimals(&self) -> u32 {
        decimals_of(self.tick_size)
    }

    /// Decimal places implied by the minimum order quantity
    pub fn qty_decimals(&self) -> u32 {
        decimals_of(self.min_order_qty)
    }
}

fn decimals_of(step: f64) -> u32 {
    let mut dp = 0u32;
    let mut step = step;
    while dp < 10 && (step - step.round()).abs() > 1e-9 {
        step *= 10.0;
        dp += 1;
    }
    dp
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub symbol: String,
    pub order_id: String,
    pub order_status: String,
}

/// Payload for market and limit order submission
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub category: &'static str,
    pub symbol: String,
    pub side: Side,
    pub order_type: &'static str,
    pub qty: f64,
    pub time_in_force: &'static str,
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    pub order_link_id: String,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, qty: f64) -> Self {
        Self {
            category: "linear",
            symbol: symbol.to_string(),
            side,
            order_type: "Market",
            qty,
            time_in_force: "GTC",
            reduce_only: false,
            price: None,
            take_profit: None,
            stop_loss: None,
            order_link_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn limit(symbol: &str, side: Side, qty: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            order_type: "Limit",
            ..Self::market(symbol, side, qty)
        }
    }

    pub fn with_protection(mut self, take_profit: Option<f64>, stop_loss: Option<f64>) -> Self {
        self.take_profit = take_profit;
        self.stop_loss = stop_loss;
        self
    }
}

/// Payload for adjusting stop-loss/take-profit on a live position
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingStopRequest {
    pub category: &'static str,
    pub symbol: String,
    pub side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
}

impl TradingStopRequest {
    pub fn new(symbol: &str, side: Side) -> Self {
        Self {
            category: "linear",
            symbol: symbol.to_string(),
            side,
            take_profit: None,
            stop_loss: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_decimals() {
        let mut info = InstrumentInfo {
            symbol: "XYZUSDT".to_string(),
            tick_size: 0.001,
            min_order_qty: 1.0,
        };
        assert_eq!(info.tick_decimals(), 3);

        info.tick_size = 1.0;
        assert_eq!(info.tick_decimals(), 0);

        info.tick_size = 0.5;
        assert_eq!(info.tick_decimals(), 1);

        info.min_order_qty = 0.01;
        assert_eq!(info.qty_decimals(), 2);
    }

    #[test]
    fn test_order_request_serializes_category() {
        let req = OrderRequest::market("XYZUSDT", Side::Buy, 10.0)
            .with_protection(Some(2.2), Some(1.8));
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["category"], "linear");
        assert_eq!(value["orderType"], "Market");
        assert_eq!(value["takeProfit"], 2.2);
        assert_eq!(value["stopLoss"], 1.8);
        assert!(value.get("price").is_none());
    }

    #[test]
    fn test_limit_request_carries_price() {
        let req = OrderRequest::limit("XYZUSDT", Side::Sell, 5.0, 3.15);
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["orderType"], "Limit");
        assert_eq!(value["price"], 3.15);
    }
}
