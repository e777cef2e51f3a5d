use thiserror::Error;

use crate::execution::PositionStatus;

/// How the control loop reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, rate limits, exchange 5xx. Retried at the next scheduled call.
    Transient,
    /// Exchange rejections that mean "already in the requested state".
    Benign,
    /// Abandons the symbol for this cycle.
    PerSymbol,
    /// Exchange truth doesn't match a known shape. Best guess plus a warning.
    Reconciliation,
    /// The loop must not enter Trading.
    Fatal,
}

#[derive(Error, Debug)]
pub enum BotError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange API error (HTTP {status}, code {code}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid exchange data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Precision error for {symbol}: {reason}")]
    Precision { symbol: String, reason: String },

    #[error("Order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    #[error("Already have an open position for {0}")]
    DuplicatePosition(String),

    #[error("No open position for {0}")]
    PositionNotFound(String),

    #[error("Position limit reached ({max} open)")]
    CapacityExceeded { max: usize },

    #[error("Ladder exhausted for {symbol} ({rungs} rungs)")]
    LadderExhausted { symbol: String, rungs: usize },

    #[error("Invalid status transition for {symbol}: {from:?} -> {to:?}")]
    InvalidTransition {
        symbol: String,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Reconciliation ambiguity for {symbol}: {reason}")]
    Reconciliation { symbol: String, reason: String },

    #[error("Sentiment advisor error: {0}")]
    Advisor(String),

    #[error("Startup failed: {0}")]
    Startup(String),
}

impl BotError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BotError::Http(_)
            | BotError::Json(_)
            | BotError::InvalidData(_)
            | BotError::Database(_)
            | BotError::Advisor(_) => ErrorClass::Transient,
            BotError::Api { status, code, .. } => classify_api_error(*status, *code),
            BotError::Precision { .. }
            | BotError::OrderRejected { .. }
            | BotError::DuplicatePosition(_)
            | BotError::PositionNotFound(_)
            | BotError::CapacityExceeded { .. }
            | BotError::LadderExhausted { .. }
            | BotError::InvalidTransition { .. } => ErrorClass::PerSymbol,
            BotError::Reconciliation { .. } => ErrorClass::Reconciliation,
            BotError::Migration(_)
            | BotError::Config(_)
            | BotError::InvalidSettings(_)
            | BotError::Startup(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_benign(&self) -> bool {
        self.class() == ErrorClass::Benign
    }
}

/// Map a Binance futures error payload onto an [`ErrorClass`].
///
/// -4046 "No need to change margin type" and -4059 "No need to change
/// position side" are successes in disguise.
pub fn classify_api_error(status: u16, code: i64) -> ErrorClass {
    match code {
        -4046 | -4059 => return ErrorClass::Benign,
        -1000 | -1001 | -1003 | -1007 | -1008 | -1021 => return ErrorClass::Transient,
        _ => {}
    }

    if status == 429 || status == 418 || status >= 500 {
        ErrorClass::Transient
    } else {
        ErrorClass::PerSymbol
    }
}
