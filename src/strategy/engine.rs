use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::decision::decide;
use crate::exchange::ExchangeGateway;
use crate::execution::{ActionOutcome, PositionAction, PositionStore};
use crate::indicators::{calculate_rsi, closes};
use crate::models::PumpCandidate;
use crate::risk::RiskGate;
use crate::settings::StrategySettings;
use crate::signals::{SentimentAdvisor, SignalSource};
use crate::Result;

/// What one evaluation pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionSet {
    pub steps_added: Vec<String>,
    pub half_closed: Vec<String>,
    pub closed: Vec<String>,
    pub emergency_closed: Vec<String>,
    /// Symbol and error for actions that failed this cycle
    pub failed: Vec<(String, String)>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.steps_added.is_empty()
            && self.half_closed.is_empty()
            && self.closed.is_empty()
            && self.emergency_closed.is_empty()
            && self.failed.is_empty()
    }
}

/// Why a pump candidate was passed over
#[derive(Debug, Clone, PartialEq)]
pub enum EntryRejection {
    Risk(String),
    Trend(String),
    Rsi(f64),
    Sentiment(String),
}

impl std::fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryRejection::Risk(reason) => write!(f, "risk: {}", reason),
            EntryRejection::Trend(reason) => write!(f, "trend: {}", reason),
            EntryRejection::Rsi(value) => write!(f, "RSI {:.1} below threshold", value),
            EntryRejection::Sentiment(reason) => write!(f, "sentiment: {}", reason),
        }
    }
}

/// Per-cycle decisions for open positions, plus new-entry admission
pub struct StrategyEngine {
    settings: StrategySettings,
    gateway: Arc<dyn ExchangeGateway>,
    signals: Arc<dyn SignalSource>,
    advisor: Option<Arc<dyn SentimentAdvisor>>,
    risk: RiskGate,
}

impl StrategyEngine {
    pub fn new(
        settings: StrategySettings,
        gateway: Arc<dyn ExchangeGateway>,
        signals: Arc<dyn SignalSource>,
        advisor: Option<Arc<dyn SentimentAdvisor>>,
        risk: RiskGate,
    ) -> Self {
        Self {
            settings,
            gateway,
            signals,
            advisor,
            risk,
        }
    }

    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    /// Book an exchange-side stop fill found by resync
    pub fn record_stop_out(&mut self, symbol: &str, realized_pnl: f64, now: DateTime<Utc>) {
        self.risk.record_realized(realized_pnl, now);
        if realized_pnl < 0.0 {
            self.risk.record_emergency_close(symbol, now);
        }
    }

    /// Decide and apply at most one action per open position.
    ///
    /// A failure on one symbol is logged and recorded; the rest still run.
    pub async fn evaluate(
        &mut self,
        store: &mut PositionStore,
        marks: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> ActionSet {
        let mut actions = ActionSet::default();

        let plan: Vec<(String, PositionAction, f64)> = store
            .positions()
            .filter_map(|position| {
                let Some(price) = marks.get(position.symbol()).copied() else {
                    if position.status().is_open() {
                        tracing::warn!("No mark price for {}, skipping this cycle", position.symbol());
                    }
                    return None;
                };
                decide(position, price, &self.settings, now)
                    .map(|action| (position.symbol().to_string(), action, price))
            })
            .collect();

        for (symbol, action, price) in plan {
            if action == PositionAction::AddStep && !self.deep_step_allowed(store, &symbol).await {
                continue;
            }

            match store.apply(&symbol, action, price).await {
                Ok(ActionOutcome::Applied { realized_pnl }) => match action {
                    PositionAction::AddStep => actions.steps_added.push(symbol),
                    PositionAction::HalfClose => {
                        self.risk.record_realized(realized_pnl, now);
                        actions.half_closed.push(symbol);
                    }
                    PositionAction::Close => {
                        self.risk.record_realized(realized_pnl, now);
                        actions.closed.push(symbol);
                    }
                    PositionAction::EmergencyClose => {
                        self.risk.record_realized(realized_pnl, now);
                        if realized_pnl < 0.0 {
                            self.risk.record_emergency_close(&symbol, now);
                        }
                        actions.emergency_closed.push(symbol);
                    }
                },
                Ok(ActionOutcome::Skipped(reason)) => {
                    tracing::debug!("{:?} on {} skipped: {}", action, symbol, reason);
                }
                Err(e) => {
                    tracing::warn!(
                        "❌ {:?} on {} failed ({:?}): {}",
                        action,
                        symbol,
                        e.class(),
                        e
                    );
                    actions.failed.push((symbol, e.to_string()));
                }
            }
        }

        actions
    }

    /// RSI circuit breaker: no deep step while the coin is still overbought.
    /// An unavailable RSI does not block.
    async fn deep_step_allowed(&self, store: &PositionStore, symbol: &str) -> bool {
        let Some(limit) = self.settings.rsi_circuit_breaker else {
            return true;
        };
        let next_index = store.get(symbol).map(|p| p.steps().len()).unwrap_or(0);
        if next_index < self.settings.rsi_circuit_breaker_min_steps {
            return true;
        }

        match self.rsi(symbol).await {
            Some(rsi) if rsi > limit => {
                tracing::info!(
                    "🛑 Holding step {} on {}: RSI {:.1} above {:.1}",
                    next_index,
                    symbol,
                    rsi,
                    limit
                );
                false
            }
            _ => true,
        }
    }

    /// RSI on the configured interval, `None` when it can't be computed
    async fn rsi(&self, symbol: &str) -> Option<f64> {
        let period = self.settings.rsi_period;
        match self
            .gateway
            .klines(symbol, &self.settings.rsi_interval, period + 10)
            .await
        {
            Ok(klines) => calculate_rsi(&closes(&klines), period),
            Err(e) => {
                tracing::debug!("RSI unavailable for {}: {}", symbol, e);
                None
            }
        }
    }

    /// Look for pumps to short and open at most one position per admitted candidate.
    ///
    /// Returns the symbols opened.
    pub async fn scan_for_entries(
        &mut self,
        store: &mut PositionStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut candidates = self
            .signals
            .find_pumped_coins(self.settings.min_pump_percent)
            .await?;

        candidates.retain(|c| {
            !store.contains(&c.symbol)
                && !self.settings.is_excluded(&c.symbol)
                && self.risk.check_symbol(&c.symbol, now).is_ok()
        });
        candidates.sort_by(|a, b| b.pump_percent.total_cmp(&a.pump_percent));
        candidates.truncate(self.settings.entry_batch_size);

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut available = self.gateway.balance().await?.available_balance;
        if !self.risk.can_open_new_position(store, available) {
            tracing::debug!(
                "No room for new entries ({} open, ${:.2} available)",
                store.open_count(),
                available
            );
            return Ok(Vec::new());
        }
        let first_rung = self.settings.rung(0).unwrap_or_default();
        let mut opened = Vec::new();

        for candidate in candidates {
            if let Err(rejection) = self
                .admit(store.open_count(), available, &candidate, now)
                .await
            {
                tracing::info!(
                    "⏭️ Skipping {} (+{:.1}%): {}",
                    candidate.symbol,
                    candidate.pump_percent,
                    rejection
                );
                continue;
            }

            match store.open_position(&candidate).await {
                Ok(()) => {
                    available -= first_rung;
                    opened.push(candidate.symbol.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        "❌ Entry on {} failed ({:?}): {}",
                        candidate.symbol,
                        e.class(),
                        e
                    );
                }
            }
        }

        Ok(opened)
    }

    /// Risk gate, then trend, then RSI, then sentiment for big pumps
    async fn admit(
        &self,
        open_positions: usize,
        available: f64,
        candidate: &PumpCandidate,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), EntryRejection> {
        self.risk
            .check(open_positions, available, now)
            .map_err(|denied| EntryRejection::Risk(denied.to_string()))?;

        match self.signals.check_trend(&candidate.symbol).await {
            Ok(verdict) if verdict.ok_to_short => {}
            Ok(verdict) => return Err(EntryRejection::Trend(verdict.reason)),
            Err(e) => return Err(EntryRejection::Trend(format!("check failed: {}", e))),
        }

        match self.rsi(&candidate.symbol).await {
            Some(rsi) if rsi < self.settings.min_rsi => return Err(EntryRejection::Rsi(rsi)),
            Some(rsi) => tracing::debug!("RSI {:.1} on {}", rsi, candidate.symbol),
            None => tracing::debug!("RSI unavailable for {}, not filtering", candidate.symbol),
        }

        if candidate.pump_percent >= self.settings.sentiment_min_pump {
            if let Some(advisor) = &self.advisor {
                match advisor
                    .is_good_short_entry(&candidate.symbol, candidate.pump_percent)
                    .await
                {
                    Ok(verdict) if !verdict.is_good => {
                        return Err(EntryRejection::Sentiment(verdict.reason));
                    }
                    Ok(verdict) => tracing::info!(
                        "🤖 {} FOMO {:.0}%: {}",
                        candidate.symbol,
                        verdict.fomo_level.unwrap_or_default(),
                        verdict.reason
                    ),
                    Err(e) => tracing::warn!(
                        "Sentiment advisor unavailable for {}, allowing entry: {}",
                        candidate.symbol,
                        e
                    ),
                }
            }
        }

        Ok(())
    }
}
