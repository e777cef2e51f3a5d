use serde::{Deserialize, Serialize};

/// Order side on the futures venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

/// Direction of a managed position. The strategy only ever sells pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        }
    }
}

/// Exchange order type as reported by the open-order listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
    TrailingStopMarket,
    Other(String),
}

impl OrderKind {
    pub fn from_exchange_type(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "MARKET" => OrderKind::Market,
            "LIMIT" => OrderKind::Limit,
            "STOP_MARKET" | "STOP" => OrderKind::StopMarket,
            "TAKE_PROFIT_MARKET" | "TAKE_PROFIT" => OrderKind::TakeProfitMarket,
            "TRAILING_STOP_MARKET" => OrderKind::TrailingStopMarket,
            other => OrderKind::Other(other.to_string()),
        }
    }
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// 24h rolling statistics for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_percent: f64,
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    pub wallet_balance: f64,
    pub available_balance: f64,
}

/// A non-zero position as the exchange reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed amount. Negative is short.
    pub position_amt: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

impl ExchangePosition {
    pub fn is_short(&self) -> bool {
        self.position_amt < 0.0
    }

    pub fn quantity(&self) -> f64 {
        self.position_amt.abs()
    }

    /// Isolated margin implied by size, entry and leverage
    pub fn margin(&self) -> f64 {
        if self.leverage == 0 {
            return 0.0;
        }
        self.quantity() * self.entry_price / self.leverage as f64
    }
}

/// A working order, standard or algo (conditional)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: String,
    pub order_id: i64,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub trigger_price: Option<f64>,
    pub reduce_only: bool,
    pub is_algo: bool,
}

/// Result of an order placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub symbol: String,
    pub status: String,
    pub executed_qty: f64,
    /// 0.0 when the venue did not report a fill price
    pub avg_price: f64,
}

impl OrderAck {
    /// Fill price, falling back to `mark` when the venue reported none
    pub fn fill_price_or(&self, mark: f64) -> f64 {
        if self.avg_price > 0.0 {
            self.avg_price
        } else {
            mark
        }
    }

    /// Filled quantity, falling back to the requested quantity when unreported
    pub fn filled_or(&self, requested: f64) -> f64 {
        if self.executed_qty > 0.0 {
            self.executed_qty
        } else {
            requested
        }
    }
}

/// A coin that rose enough over 24h to be a short candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpCandidate {
    pub symbol: String,
    pub pump_percent: f64,
    pub reference_price: f64,
    pub quote_volume: f64,
}
