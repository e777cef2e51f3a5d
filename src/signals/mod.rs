// Entry signals: pump detection, trend confirmation, sentiment
pub mod grok;
pub mod pump_scanner;

pub use grok::GrokAdvisor;
pub use pump_scanner::{assess_trend, PumpScanner};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::PumpCandidate;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendVerdict {
    pub ok_to_short: bool,
    pub reason: String,
}

impl TrendVerdict {
    pub fn ok(reason: impl Into<String>) -> Self {
        Self {
            ok_to_short: true,
            reason: reason.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok_to_short: false,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentVerdict {
    pub is_good: bool,
    /// 0-100 estimate of retail FOMO, when the advisor gives one
    pub fomo_level: Option<f64>,
    pub reason: String,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Symbols up at least `min_percent` over 24h, strongest first
    async fn find_pumped_coins(&self, min_percent: f64) -> Result<Vec<PumpCandidate>>;

    /// Whether the pump has stalled enough to short into
    async fn check_trend(&self, symbol: &str) -> Result<TrendVerdict>;
}

#[async_trait]
pub trait SentimentAdvisor: Send + Sync {
    async fn is_good_short_entry(&self, symbol: &str, pump_percent: f64)
        -> Result<SentimentVerdict>;
}
