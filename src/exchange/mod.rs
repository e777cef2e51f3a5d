// Exchange gateway: market data, account state and order routing
pub mod binance;
pub mod precision;
pub mod signing;

pub use binance::BinanceClient;
pub use precision::SymbolRules;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{
    AccountBalance, ExchangePosition, Kline, OpenOrder, OrderAck, OrderSide, Ticker24h,
    TimeInForce,
};
use crate::Result;

/// Everything the bot needs from the futures venue.
///
/// Implementations must be safe to share across tasks; the control loop holds
/// an `Arc<dyn ExchangeGateway>`.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Server time in milliseconds, doubles as a connectivity check
    async fn server_time(&self) -> Result<i64>;

    /// Load per-symbol tick and lot sizes used by the rounding functions
    async fn load_trading_rules(&self) -> Result<usize> {
        Ok(0)
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64>;

    /// Mark prices for every listed symbol
    async fn mark_prices(&self) -> Result<HashMap<String, f64>>;

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>>;

    async fn tickers_24h(&self) -> Result<Vec<Ticker24h>>;

    /// Quote-asset balance of the futures wallet
    async fn balance(&self) -> Result<AccountBalance>;

    /// Non-zero positions only
    async fn account_positions(&self) -> Result<Vec<ExchangePosition>>;

    /// Standard and algo orders merged
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>>;

    /// Set leverage and isolated margin. "Already set" rejections are success.
    async fn prepare_symbol(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck>;

    /// Reduce-only stop-market
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck>;

    /// Reduce-only take-profit-market
    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck>;

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        callback_rate_percent: f64,
        activation_price: Option<f64>,
    ) -> Result<OrderAck>;

    /// Cancel by id, trying the algo endpoint first and the standard one second
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    /// Floor to the symbol's tick size
    fn round_price(&self, symbol: &str, price: f64) -> f64;

    /// Floor to the symbol's lot step
    fn round_quantity(&self, symbol: &str, quantity: f64) -> f64;
}
