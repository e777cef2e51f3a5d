use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::precision::{format_decimal, SymbolRules};
use super::signing::{encode_params, sign_query};
use super::ExchangeGateway;
use crate::error::BotError;
use crate::models::{
    AccountBalance, ExchangePosition, Kline, OpenOrder, OrderAck, OrderKind, OrderSide, Ticker24h,
    TimeInForce,
};
use crate::settings::ExchangeSettings;
use crate::Result;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance USDT-M futures REST client with request signing and rate limiting
///
/// Cloneable; clones share the rate limiter and the trading-rules cache.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    quote_asset: String,
    rate_limiter: Arc<BinanceRateLimiter>,
    rules: Arc<RwLock<HashMap<String, SymbolRules>>>,
}

/// Error payload: `{"code": -2019, "msg": "Margin is insufficient."}`
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    symbol: String,
    #[serde(deserialize_with = "string_or_number")]
    mark_price: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    symbol: String,
    #[serde(deserialize_with = "string_or_number")]
    last_price: f64,
    #[serde(deserialize_with = "string_or_number")]
    price_change_percent: f64,
    #[serde(deserialize_with = "string_or_number")]
    quote_volume: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceEntry {
    asset: String,
    #[serde(deserialize_with = "string_or_number")]
    balance: f64,
    #[serde(deserialize_with = "string_or_number")]
    available_balance: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskEntry {
    symbol: String,
    #[serde(deserialize_with = "string_or_number")]
    position_amt: f64,
    #[serde(deserialize_with = "string_or_number")]
    entry_price: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    mark_price: f64,
    #[serde(default, rename = "unRealizedProfit", deserialize_with = "string_or_number")]
    unrealized_profit: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    leverage: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    symbol: String,
    order_id: i64,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    #[serde(default, deserialize_with = "string_or_number")]
    orig_qty: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    price: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    stop_price: f64,
    #[serde(default)]
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlgoOrderEntry {
    symbol: String,
    algo_id: i64,
    #[serde(alias = "type")]
    order_type: String,
    side: String,
    #[serde(default, alias = "origQty", deserialize_with = "string_or_number")]
    quantity: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    price: f64,
    #[serde(default, alias = "stopPrice", deserialize_with = "string_or_number")]
    trigger_price: f64,
    #[serde(default)]
    reduce_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(alias = "algoId")]
    order_id: i64,
    symbol: String,
    #[serde(default, alias = "algoStatus")]
    status: String,
    #[serde(default, deserialize_with = "string_or_number")]
    executed_qty: f64,
    #[serde(default, deserialize_with = "string_or_number")]
    avg_price: f64,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    price_precision: Option<u32>,
    #[serde(default)]
    quantity_precision: Option<u32>,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

/// Binance encodes most numbers as strings
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0.0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl BinanceClient {
    pub fn new(settings: &ExchangeSettings, api_key: String, api_secret: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        let spacing = Duration::from_millis(settings.min_request_interval_ms.max(1));
        let quota = Quota::with_period(spacing).ok_or_else(|| {
            BotError::InvalidSettings("exchange.min_request_interval_ms must be positive".into())
        })?;

        Ok(Self {
            client,
            base_url: settings.rest_url().trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            recv_window_ms: settings.recv_window_ms,
            quote_asset: settings.quote_asset.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            rules: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn symbol_rules(&self, symbol: &str) -> SymbolRules {
        self.rules
            .read()
            .ok()
            .and_then(|rules| rules.get(symbol).cloned())
            .unwrap_or_default()
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        self.send(Method::GET, path, params, false).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.send(method, path, params, true).await
    }

    /// One rate-limited request. Non-2xx responses become [`BotError::Api`].
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let mut query = encode_params(params);
        if signed {
            if !query.is_empty() {
                query.push('&');
            }
            query.push_str(&format!(
                "recvWindow={}&timestamp={}",
                self.recv_window_ms,
                chrono::Utc::now().timestamp_millis()
            ));
            let signature = sign_query(&self.api_secret, &query)?;
            query.push_str(&format!("&signature={}", signature));
        }

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let mut request = self.client.request(method, &url);
        if signed {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn list_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let params = symbol_param(symbol);
        let entries: Vec<AlgoOrderEntry> = self
            .signed(Method::GET, "/fapi/v1/openAlgoOrders", &params)
            .await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let side = OrderSide::parse(&entry.side)?;
                Some(OpenOrder {
                    symbol: entry.symbol,
                    order_id: entry.algo_id,
                    kind: OrderKind::from_exchange_type(&entry.order_type),
                    side,
                    quantity: entry.quantity,
                    price: entry.price,
                    trigger_price: positive(entry.trigger_price),
                    reduce_only: entry.reduce_only,
                    is_algo: true,
                })
            })
            .collect())
    }

    async fn place_conditional(
        &self,
        symbol: &str,
        order_type: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        let params = vec![
            ("algoType", "CONDITIONAL".to_string()),
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("quantity", format_decimal(quantity)),
            ("triggerPrice", format_decimal(trigger_price)),
            ("reduceOnly", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];

        let response: OrderResponse = self
            .signed(Method::POST, "/fapi/v1/algoOrder", &params)
            .await?;

        tracing::debug!(
            "Placed {} {} for {} at {} (algo {})",
            order_type,
            side.as_str(),
            symbol,
            trigger_price,
            response.order_id
        );

        Ok(ack_from(response))
    }

    async fn place_order(&self, params: Vec<(&str, String)>) -> Result<OrderAck> {
        let response: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        Ok(ack_from(response))
    }

    fn is_quote_symbol(&self, symbol: &str) -> bool {
        symbol.ends_with(&self.quote_asset)
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    async fn server_time(&self) -> Result<i64> {
        let time: ServerTime = self.public("/fapi/v1/time", &[]).await?;
        Ok(time.server_time)
    }

    async fn load_trading_rules(&self) -> Result<usize> {
        let info: ExchangeInfo = self.public("/fapi/v1/exchangeInfo", &[]).await?;

        let mut loaded = HashMap::with_capacity(info.symbols.len());
        for symbol in info.symbols {
            if let Some(rules) = rules_from_info(&symbol) {
                loaded.insert(symbol.symbol, rules);
            }
        }

        let count = loaded.len();
        match self.rules.write() {
            Ok(mut rules) => *rules = loaded,
            Err(_) => return Err(BotError::InvalidData("trading rules cache poisoned".into())),
        }

        Ok(count)
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let index: PremiumIndex = self
            .public("/fapi/v1/premiumIndex", &[("symbol", symbol.to_string())])
            .await?;

        if index.mark_price <= 0.0 {
            return Err(BotError::InvalidData(format!("no mark price for {}", symbol)));
        }
        Ok(index.mark_price)
    }

    async fn mark_prices(&self) -> Result<HashMap<String, f64>> {
        let entries: Vec<PremiumIndex> = self.public("/fapi/v1/premiumIndex", &[]).await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.mark_price > 0.0)
            .map(|entry| (entry.symbol, entry.mark_price))
            .collect())
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<Vec<serde_json::Value>> = self.public("/fapi/v1/klines", &params).await?;

        rows.iter()
            .map(|row| parse_kline(row))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| BotError::InvalidData(format!("malformed kline row for {}", symbol)))
    }

    async fn tickers_24h(&self) -> Result<Vec<Ticker24h>> {
        let entries: Vec<TickerEntry> = self.public("/fapi/v1/ticker/24hr", &[]).await?;
        Ok(entries
            .into_iter()
            .map(|entry| Ticker24h {
                symbol: entry.symbol,
                last_price: entry.last_price,
                price_change_percent: entry.price_change_percent,
                quote_volume: entry.quote_volume,
            })
            .collect())
    }

    async fn balance(&self) -> Result<AccountBalance> {
        let entries: Vec<BalanceEntry> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;

        entries
            .into_iter()
            .find(|entry| entry.asset == self.quote_asset)
            .map(|entry| AccountBalance {
                wallet_balance: entry.balance,
                available_balance: entry.available_balance,
            })
            .ok_or_else(|| {
                BotError::InvalidData(format!("{} asset not found in balance", self.quote_asset))
            })
    }

    async fn account_positions(&self) -> Result<Vec<ExchangePosition>> {
        let entries: Vec<PositionRiskEntry> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &[])
            .await?;

        Ok(entries
            .into_iter()
            .filter(|entry| entry.position_amt != 0.0 && self.is_quote_symbol(&entry.symbol))
            .map(|entry| ExchangePosition {
                symbol: entry.symbol,
                position_amt: entry.position_amt,
                entry_price: entry.entry_price,
                mark_price: entry.mark_price,
                leverage: entry.leverage.round().max(0.0) as u32,
                unrealized_pnl: entry.unrealized_profit,
            })
            .collect())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let params = symbol_param(symbol);
        let entries: Vec<OrderEntry> = self
            .signed(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;

        let mut orders: Vec<OpenOrder> = entries
            .into_iter()
            .filter_map(|entry| {
                let side = OrderSide::parse(&entry.side)?;
                Some(OpenOrder {
                    symbol: entry.symbol,
                    order_id: entry.order_id,
                    kind: OrderKind::from_exchange_type(&entry.order_type),
                    side,
                    quantity: entry.orig_qty,
                    price: entry.price,
                    trigger_price: positive(entry.stop_price),
                    reduce_only: entry.reduce_only,
                    is_algo: false,
                })
            })
            .collect();

        // Algo listing is newer and not available on every account tier
        match self.list_algo_orders(symbol).await {
            Ok(algo) => orders.extend(algo),
            Err(e) => tracing::debug!("Algo order listing unavailable: {}", e),
        }

        Ok(orders)
    }

    async fn prepare_symbol(&self, symbol: &str, leverage: u32) -> Result<()> {
        let margin_params = vec![
            ("symbol", symbol.to_string()),
            ("marginType", "ISOLATED".to_string()),
        ];
        match self
            .signed::<serde_json::Value>(Method::POST, "/fapi/v1/marginType", &margin_params)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_benign() => {}
            Err(e) => return Err(e),
        }

        let leverage_params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        match self
            .signed::<serde_json::Value>(Method::POST, "/fapi/v1/leverage", &leverage_params)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_decimal(quantity)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        self.place_order(params).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", time_in_force.as_str().to_string()),
            ("quantity", format_decimal(quantity)),
            ("price", format_decimal(price)),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        self.place_order(params).await
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        self.place_conditional(symbol, "STOP_MARKET", side, quantity, trigger_price)
            .await
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderAck> {
        self.place_conditional(symbol, "TAKE_PROFIT_MARKET", side, quantity, trigger_price)
            .await
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        callback_rate_percent: f64,
        activation_price: Option<f64>,
    ) -> Result<OrderAck> {
        // Binance accepts callbackRate in [0.1, 5]
        let callback = callback_rate_percent.clamp(0.1, 5.0);
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "TRAILING_STOP_MARKET".to_string()),
            ("quantity", format_decimal(quantity)),
            ("callbackRate", format_decimal(callback)),
            ("reduceOnly", "true".to_string()),
        ];
        if let Some(price) = activation_price {
            params.push(("activationPrice", format_decimal(price)));
        }
        self.place_order(params).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let algo_params = vec![("algoId", order_id.to_string())];
        match self
            .signed::<serde_json::Value>(Method::DELETE, "/fapi/v1/algoOrder", &algo_params)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => tracing::debug!("Algo cancel of {} on {} failed: {}", order_id, symbol, e),
        }

        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed::<serde_json::Value>(Method::DELETE, "/fapi/v1/order", &params)
            .await
            .map(|_| ())
    }

    fn round_price(&self, symbol: &str, price: f64) -> f64 {
        self.symbol_rules(symbol).round_price(price)
    }

    fn round_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        self.symbol_rules(symbol).round_quantity(quantity)
    }
}

fn api_error(status: u16, body: &str) -> BotError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => BotError::Api {
            status,
            code: err.code,
            msg: err.msg,
        },
        Err(_) => BotError::Api {
            status,
            code: 0,
            msg: body.chars().take(200).collect(),
        },
    }
}

fn ack_from(response: OrderResponse) -> OrderAck {
    OrderAck {
        order_id: response.order_id,
        symbol: response.symbol,
        status: response.status,
        executed_qty: response.executed_qty,
        avg_price: response.avg_price,
    }
}

fn symbol_param(symbol: Option<&str>) -> Vec<(&'static str, String)> {
    symbol
        .map(|s| vec![("symbol", s.to_string())])
        .unwrap_or_default()
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
fn parse_kline(row: &[serde_json::Value]) -> Option<Kline> {
    let number = |i: usize| -> Option<f64> {
        match row.get(i)? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };

    Some(Kline {
        open_time: row.first()?.as_i64()?,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
        close_time: row.get(6)?.as_i64()?,
    })
}

fn rules_from_info(info: &SymbolInfo) -> Option<SymbolRules> {
    let filter = |kind: &str, field: &str| -> Option<String> {
        info.filters
            .iter()
            .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(kind))
            .and_then(|f| f.get(field))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let tick = filter("PRICE_FILTER", "tickSize");
    let step = filter("LOT_SIZE", "stepSize");
    let min_qty = filter("LOT_SIZE", "minQty");

    match (tick, step) {
        (Some(tick), Some(step)) => SymbolRules::from_filters(&tick, &step, min_qty.as_deref()),
        _ => Some(SymbolRules::from_precision(
            info.price_precision?,
            info.quantity_precision?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kline_row() {
        let row = vec![
            json!(1700000000000i64),
            json!("1.10"),
            json!("1.25"),
            json!("1.05"),
            json!("1.20"),
            json!("123456.7"),
            json!(1700000899999i64),
            json!("148148.04"),
        ];
        let kline = parse_kline(&row).unwrap();
        assert_eq!(kline.close, 1.20);
        assert_eq!(kline.close_time, 1700000899999);
    }

    #[test]
    fn test_api_error_parsing() {
        let err = api_error(400, r#"{"code":-4046,"msg":"No need to change margin type."}"#);
        assert!(err.is_benign());

        let err = api_error(502, "<html>Bad Gateway</html>");
        assert!(matches!(err, BotError::Api { status: 502, code: 0, .. }));
    }

    #[test]
    fn test_rules_from_filters() {
        let info: SymbolInfo = serde_json::from_value(json!({
            "symbol": "PEPEUSDT",
            "pricePrecision": 7,
            "quantityPrecision": 0,
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.0000001", "minPrice": "0.0000001"},
                {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1"}
            ]
        }))
        .unwrap();

        let rules = rules_from_info(&info).unwrap();
        assert_eq!(rules.round_price(0.00001234567), 0.0000123);
        assert_eq!(rules.round_quantity(1500.7), 1500.0);
    }
}
