use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::BotError;
use crate::exchange::{ExchangeGateway, SymbolRules};
use crate::models::{
    AccountBalance, ExchangePosition, Kline, OpenOrder, OrderAck, OrderKind, OrderSide, Ticker24h,
    TimeInForce,
};
use crate::Result;

const INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone)]
struct SimPosition {
    /// Signed, negative is short
    amount: f64,
    entry_price: f64,
    leverage: u32,
}

#[derive(Debug, Default)]
struct SimState {
    wallet: f64,
    marks: HashMap<String, f64>,
    klines: HashMap<(String, String), Vec<Kline>>,
    tickers: Vec<Ticker24h>,
    positions: HashMap<String, SimPosition>,
    leverage: HashMap<String, u32>,
    orders: Vec<OpenOrder>,
    next_order_id: i64,
    failing_entries: HashSet<String>,
    unreachable: bool,
    calls: Vec<String>,
}

impl SimState {
    fn next_id(&mut self) -> i64 {
        self.next_order_id += 1;
        self.next_order_id
    }

    fn used_margin(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.amount.abs() * p.entry_price / p.leverage.max(1) as f64)
            .sum()
    }

    fn mark(&self, symbol: &str) -> Result<f64> {
        self.marks
            .get(symbol)
            .copied()
            .ok_or_else(|| BotError::Api {
                status: 400,
                code: -1121,
                msg: format!("Invalid symbol {}", symbol),
            })
    }

    /// Move the book by a fill at `price`. Returns the filled quantity.
    fn fill(&mut self, symbol: &str, side: OrderSide, quantity: f64, price: f64, reduce_only: bool) -> f64 {
        let leverage = self.leverage.get(symbol).copied().unwrap_or(1);
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert(SimPosition {
                amount: 0.0,
                entry_price: 0.0,
                leverage,
            });

        let filled = match side {
            OrderSide::Sell => {
                let current = position.amount.abs();
                let total = current + quantity;
                position.entry_price = (position.entry_price * current + price * quantity) / total;
                position.amount = -total;
                quantity
            }
            OrderSide::Buy => {
                let held = position.amount.abs();
                let filled = if reduce_only { quantity.min(held) } else { quantity };
                self.wallet += (position.entry_price - price) * filled;
                position.amount += filled;
                filled
            }
        };

        if position.amount.abs() < 1e-12 {
            self.positions.remove(symbol);
            self.orders.retain(|o| o.symbol != symbol || !o.reduce_only);
        }
        filled
    }
}

/// In-memory USDT-M venue: fills at the mark, isolated margin, no fees.
///
/// Rounding uses the default symbol rules (6 price decimals, 3 quantity decimals).
pub struct SimulatedExchange {
    state: Mutex<SimState>,
    rules: SymbolRules,
}

impl SimulatedExchange {
    pub fn new(wallet: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                wallet,
                ..Default::default()
            }),
            rules: SymbolRules::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a call, failing it if the venue is unreachable
    fn enter(&self, call: String) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.unreachable {
            return Err(BotError::Api {
                status: 503,
                code: -1001,
                msg: "Internal error; unable to process your request".to_string(),
            });
        }
        Ok(state)
    }

    pub fn set_mark(&self, symbol: &str, price: f64) {
        self.lock().marks.insert(symbol.to_string(), price);
    }

    /// Candles for `interval` closing at the given prices, oldest first
    pub fn set_closes(&self, symbol: &str, interval: &str, closes: &[f64]) {
        let start = Utc::now().timestamp_millis() - closes.len() as i64 * INTERVAL_MS;
        let klines = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open_time = start + i as i64 * INTERVAL_MS;
                Kline {
                    open_time,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: 1_000.0,
                    close_time: open_time + INTERVAL_MS - 1,
                }
            })
            .collect();
        self.lock()
            .klines
            .insert((symbol.to_string(), interval.to_string()), klines);
    }

    pub fn set_tickers(&self, tickers: Vec<Ticker24h>) {
        self.lock().tickers = tickers;
    }

    /// A position that exists before the bot starts. Negative `amount` is short.
    pub fn seed_position(&self, symbol: &str, amount: f64, entry_price: f64, leverage: u32) {
        let mut state = self.lock();
        state.leverage.insert(symbol.to_string(), leverage);
        state.marks.entry(symbol.to_string()).or_insert(entry_price);
        state.positions.insert(
            symbol.to_string(),
            SimPosition {
                amount,
                entry_price,
                leverage,
            },
        );
    }

    /// A reduce-only BUY working order. Returns its id.
    pub fn seed_order(&self, symbol: &str, kind: OrderKind, quantity: f64, trigger_price: f64) -> i64 {
        let mut state = self.lock();
        let order_id = state.next_id();
        let is_algo = matches!(kind, OrderKind::StopMarket | OrderKind::TakeProfitMarket);
        state.orders.push(OpenOrder {
            symbol: symbol.to_string(),
            order_id,
            kind,
            side: OrderSide::Buy,
            quantity,
            price: 0.0,
            trigger_price: Some(trigger_price),
            reduce_only: true,
            is_algo,
        });
        order_id
    }

    /// The position disappears as if a stop fired or someone closed it by hand
    pub fn close_externally(&self, symbol: &str) {
        let mut state = self.lock();
        state.positions.remove(symbol);
        state.orders.retain(|o| o.symbol != symbol);
    }

    /// Opening orders on `symbol` are rejected for insufficient margin
    pub fn fail_entries_for(&self, symbol: &str) {
        self.lock().failing_entries.insert(symbol.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn position(&self, symbol: &str) -> Option<ExchangePosition> {
        let state = self.lock();
        state.positions.get(symbol).map(|p| ExchangePosition {
            symbol: symbol.to_string(),
            position_amt: p.amount,
            entry_price: p.entry_price,
            mark_price: state.marks.get(symbol).copied().unwrap_or(p.entry_price),
            leverage: p.leverage,
            unrealized_pnl: 0.0,
        })
    }

    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.lock().orders.iter().filter(|o| o.symbol == symbol).count()
    }

    pub fn open_orders_for(&self, symbol: &str) -> Vec<OpenOrder> {
        self.lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn wallet(&self) -> f64 {
        self.lock().wallet
    }

    /// Every gateway call so far, as "method SYMBOL"
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls that place or cancel orders
    pub fn order_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("place_") || c.starts_with("cancel_"))
            .collect()
    }

    fn place_conditional(
        &self,
        call: &str,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        kind: OrderKind,
        trigger_price: Option<f64>,
    ) -> Result<OrderAck> {
        let mut state = self.enter(format!("{} {}", call, symbol))?;
        if !state.positions.contains_key(symbol) {
            return Err(BotError::Api {
                status: 400,
                code: -2022,
                msg: "ReduceOnly Order is rejected.".to_string(),
            });
        }

        let order_id = state.next_id();
        let is_algo = matches!(kind, OrderKind::StopMarket | OrderKind::TakeProfitMarket);
        state.orders.push(OpenOrder {
            symbol: symbol.to_string(),
            order_id,
            kind,
            side,
            quantity,
            price: 0.0,
            trigger_price,
            reduce_only: true,
            is_algo,
        });

        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: "NEW".to_string(),
            executed_qty: 0.0,
            avg_price: 0.0,
        })
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    async fn server_time(&self) -> Result<i64> {
        drop(self.enter("server_time".to_string())?);
        Ok(Utc::now().timestamp_millis())
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        self.enter(format!("mark_price {}", symbol))?.mark(symbol)
    }

    async fn mark_prices(&self) -> Result<HashMap<String, f64>> {
        Ok(self.enter("mark_prices".to_string())?.marks.clone())
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let state = self.enter(format!("klines {}", symbol))?;
        let klines = state
            .klines
            .get(&(symbol.to_string(), interval.to_string()))
            .cloned()
            .unwrap_or_default();
        let skip = klines.len().saturating_sub(limit);
        Ok(klines.into_iter().skip(skip).collect())
    }

    async fn tickers_24h(&self) -> Result<Vec<Ticker24h>> {
        Ok(self.enter("tickers_24h".to_string())?.tickers.clone())
    }

    async fn balance(&self) -> Result<AccountBalance> {
        let state = self.enter("balance".to_string())?;
        Ok(AccountBalance {
            wallet_balance: state.wallet,
            available_balance: state.wallet - state.used_margin(),
        })
    }

    async fn account_positions(&self) -> Result<Vec<ExchangePosition>> {
        let state = self.enter("account_positions".to_string())?;
        let mut positions: Vec<ExchangePosition> = state
            .positions
            .iter()
            .filter(|(_, p)| p.amount != 0.0)
            .map(|(symbol, p)| {
                let mark = state.marks.get(symbol).copied().unwrap_or(p.entry_price);
                ExchangePosition {
                    symbol: symbol.clone(),
                    position_amt: p.amount,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    leverage: p.leverage,
                    unrealized_pnl: (mark - p.entry_price) * p.amount,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let state = self.enter(format!("open_orders {}", symbol.unwrap_or("*")))?;
        Ok(state
            .orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn prepare_symbol(&self, symbol: &str, leverage: u32) -> Result<()> {
        let mut state = self.enter(format!("prepare_symbol {}", symbol))?;
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut state = self.enter(format!("place_market_order {} {}", side.as_str(), symbol))?;
        if side == OrderSide::Sell && !reduce_only && state.failing_entries.contains(symbol) {
            return Err(BotError::Api {
                status: 400,
                code: -2019,
                msg: "Margin is insufficient.".to_string(),
            });
        }

        let price = state.mark(symbol)?;
        let filled = state.fill(symbol, side, quantity, price, reduce_only);
        let order_id = state.next_id();

        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: "FILLED".to_string(),
            executed_qty: filled,
            avg_price: price,
        })
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck> {
        let mut state = self.enter(format!("place_limit_order {} {}", side.as_str(), symbol))?;
        let mark = state.mark(symbol)?;
        let order_id = state.next_id();

        let marketable = match side {
            OrderSide::Sell => price <= mark,
            OrderSide::Buy => price >= mark,
        };
        if !marketable {
            let status = match time_in_force {
                TimeInForce::Ioc => "EXPIRED",
                TimeInForce::Gtc => "NEW",
            };
            return Ok(OrderAck {
                order_id,
                symbol: symbol.to_string(),
                status: status.to_string(),
                executed_qty: 0.0,
                avg_price: 0.0,
            });
        }

        let filled = state.fill(symbol, side, quantity, mark, false);
        Ok(OrderAck {
            order_id,
            symbol: symbol.to_string(),
            status: "FILLED".to_string(),
            executed_qty: filled,
            avg_price: mark,
        })
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        self.place_conditional(
            "place_stop_order",
            symbol,
            side,
            quantity,
            OrderKind::StopMarket,
            Some(trigger_price),
        )
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        self.place_conditional(
            "place_take_profit_order",
            symbol,
            side,
            quantity,
            OrderKind::TakeProfitMarket,
            Some(trigger_price),
        )
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        _callback_rate_percent: f64,
        activation_price: Option<f64>,
    ) -> Result<OrderAck> {
        self.place_conditional(
            "place_trailing_stop",
            symbol,
            side,
            quantity,
            OrderKind::TrailingStopMarket,
            activation_price,
        )
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let mut state = self.enter(format!("cancel_order {}", symbol))?;
        let before = state.orders.len();
        state
            .orders
            .retain(|o| !(o.symbol == symbol && o.order_id == order_id));
        if state.orders.len() == before {
            return Err(BotError::Api {
                status: 400,
                code: -2011,
                msg: "Unknown order sent.".to_string(),
            });
        }
        Ok(())
    }

    fn round_price(&self, _symbol: &str, price: f64) -> f64 {
        self.rules.round_price(price)
    }

    fn round_quantity(&self, _symbol: &str, quantity: f64) -> f64 {
        self.rules.round_quantity(quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_time_releases_state() {
        let exchange = SimulatedExchange::new(1000.0);
        assert!(exchange.server_time().await.is_ok());
        // State is free again for the next call
        assert!(exchange.balance().await.is_ok());
        assert_eq!(exchange.calls().len(), 2);

        exchange.set_unreachable(true);
        assert!(exchange.server_time().await.is_err());
    }

    #[tokio::test]
    async fn test_sells_average_into_one_short() {
        let exchange = SimulatedExchange::new(1000.0);
        exchange.set_mark("PEPEUSDT", 1.0);
        exchange.prepare_symbol("PEPEUSDT", 10).await.unwrap();
        exchange
            .place_market_order("PEPEUSDT", OrderSide::Sell, 100.0, false)
            .await
            .unwrap();
        exchange.set_mark("PEPEUSDT", 1.5);
        exchange
            .place_market_order("PEPEUSDT", OrderSide::Sell, 100.0, false)
            .await
            .unwrap();

        let position = exchange.position("PEPEUSDT").unwrap();
        assert_eq!(position.position_amt, -200.0);
        assert!((position.entry_price - 1.25).abs() < 1e-12);

        let balance = exchange.balance().await.unwrap();
        assert!((balance.available_balance - 975.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reduce_only_buy_realizes_and_clears_protection() {
        let exchange = SimulatedExchange::new(1000.0);
        exchange.seed_position("PEPEUSDT", -100.0, 1.0, 10);
        exchange.seed_order("PEPEUSDT", OrderKind::StopMarket, 100.0, 1.4);
        exchange.set_mark("PEPEUSDT", 0.9);

        let ack = exchange
            .place_market_order("PEPEUSDT", OrderSide::Buy, 150.0, true)
            .await
            .unwrap();

        assert_eq!(ack.executed_qty, 100.0);
        assert!(exchange.position("PEPEUSDT").is_none());
        assert_eq!(exchange.open_order_count("PEPEUSDT"), 0);
        assert!((exchange.wallet() - 1010.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ioc_limit_above_mark_expires() {
        let exchange = SimulatedExchange::new(1000.0);
        exchange.set_mark("PEPEUSDT", 1.0);

        let ack = exchange
            .place_limit_order("PEPEUSDT", OrderSide::Sell, 10.0, 1.01, TimeInForce::Ioc)
            .await
            .unwrap();
        assert_eq!(ack.executed_qty, 0.0);
        assert!(exchange.position("PEPEUSDT").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_venue_fails_calls() {
        let exchange = SimulatedExchange::new(1000.0);
        exchange.set_unreachable(true);
        let err = exchange.server_time().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
    }
}
