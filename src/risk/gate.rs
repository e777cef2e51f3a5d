use chrono::{DateTime, NaiveDate, Utc};

use super::blacklist::DynamicBlacklist;
use crate::execution::PositionStore;
use crate::settings::{RiskSettings, StrategySettings};

/// Realized PnL for the current UTC day
#[derive(Debug, Clone)]
pub struct DailyLedger {
    pub day: NaiveDate,
    pub realized_pnl: f64,
}

impl DailyLedger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            realized_pnl: 0.0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            tracing::info!(
                "📅 New trading day, yesterday's realized PnL ${:.2}",
                self.realized_pnl
            );
            self.day = today;
            self.realized_pnl = 0.0;
        }
    }

    fn realized_on(&self, now: DateTime<Utc>) -> f64 {
        if now.date_naive() == self.day {
            self.realized_pnl
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDenied {
    MaxPositions { open: usize, max: usize },
    InsufficientBalance { available: f64, required: f64 },
    DailyLossLimit { realized: f64, limit: f64 },
    Blacklisted { until: DateTime<Utc> },
}

impl std::fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionDenied::MaxPositions { open, max } => {
                write!(f, "position limit reached ({}/{})", open, max)
            }
            AdmissionDenied::InsufficientBalance {
                available,
                required,
            } => write!(f, "available ${:.2} below first rung ${:.2}", available, required),
            AdmissionDenied::DailyLossLimit { realized, limit } => {
                write!(f, "daily loss ${:.2} hit limit ${:.2}", realized, limit)
            }
            AdmissionDenied::Blacklisted { until } => write!(f, "blacklisted until {}", until),
        }
    }
}

/// Capital and position-count admission control for new entries
#[derive(Debug, Clone)]
pub struct RiskGate {
    max_positions: usize,
    first_rung: f64,
    max_daily_loss: Option<f64>,
    daily: DailyLedger,
    blacklist: DynamicBlacklist,
}

impl RiskGate {
    pub fn new(risk: &RiskSettings, strategy: &StrategySettings) -> Self {
        Self {
            max_positions: risk.max_positions,
            first_rung: strategy.rung(0).unwrap_or_default(),
            max_daily_loss: risk.max_daily_loss_usd,
            daily: DailyLedger::new(Utc::now()),
            blacklist: DynamicBlacklist::new(&risk.blacklist),
        }
    }

    /// Advisory; re-checked at entry time
    pub fn can_open_new_position(&self, store: &PositionStore, available_balance: f64) -> bool {
        self.check(store.open_count(), available_balance, Utc::now())
            .is_ok()
    }

    pub fn check(
        &self,
        open_positions: usize,
        available_balance: f64,
        now: DateTime<Utc>,
    ) -> Result<(), AdmissionDenied> {
        if open_positions >= self.max_positions {
            return Err(AdmissionDenied::MaxPositions {
                open: open_positions,
                max: self.max_positions,
            });
        }

        if available_balance < self.first_rung {
            return Err(AdmissionDenied::InsufficientBalance {
                available: available_balance,
                required: self.first_rung,
            });
        }

        if let Some(limit) = self.max_daily_loss {
            let realized = self.daily.realized_on(now);
            if realized <= -limit {
                return Err(AdmissionDenied::DailyLossLimit { realized, limit });
            }
        }

        Ok(())
    }

    pub fn check_symbol(&self, symbol: &str, now: DateTime<Utc>) -> Result<(), AdmissionDenied> {
        match self.blacklist.banned_until(symbol, now) {
            Some(until) => Err(AdmissionDenied::Blacklisted { until }),
            None => Ok(()),
        }
    }

    pub fn record_realized(&mut self, pnl: f64, now: DateTime<Utc>) {
        self.daily.roll(now);
        self.daily.realized_pnl += pnl;
    }

    pub fn record_emergency_close(&mut self, symbol: &str, now: DateTime<Utc>) {
        self.blacklist.record_emergency_close(symbol, now);
    }

    pub fn daily_realized(&self) -> f64 {
        self.daily.realized_on(Utc::now())
    }
}
