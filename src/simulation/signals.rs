use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::PumpCandidate;
use crate::signals::{SignalSource, TrendVerdict};
use crate::Result;

/// Signal source that returns whatever it was given
#[derive(Debug, Default)]
pub struct ScriptedSignals {
    candidates: Mutex<Vec<PumpCandidate>>,
    trends: Mutex<HashMap<String, TrendVerdict>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_candidates(&self, candidates: Vec<PumpCandidate>) {
        *lock(&self.candidates) = candidates;
    }

    /// Convenience for a single pump at `price`
    pub fn add_pump(&self, symbol: &str, pump_percent: f64, price: f64) {
        lock(&self.candidates).push(PumpCandidate {
            symbol: symbol.to_string(),
            pump_percent,
            reference_price: price,
            quote_volume: 10_000_000.0,
        });
    }

    /// Symbols without a scripted verdict pass the trend check
    pub fn set_trend(&self, symbol: &str, verdict: TrendVerdict) {
        lock(&self.trends).insert(symbol.to_string(), verdict);
    }
}

#[async_trait]
impl SignalSource for ScriptedSignals {
    async fn find_pumped_coins(&self, min_percent: f64) -> Result<Vec<PumpCandidate>> {
        let mut candidates: Vec<PumpCandidate> = lock(&self.candidates)
            .iter()
            .filter(|c| c.pump_percent >= min_percent)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.pump_percent.total_cmp(&a.pump_percent));
        Ok(candidates)
    }

    async fn check_trend(&self, symbol: &str) -> Result<TrendVerdict> {
        Ok(lock(&self.trends)
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| TrendVerdict::ok("scripted")))
    }
}
