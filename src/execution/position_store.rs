use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::position::{Position, PositionStatus, QUANTITY_EPSILON};
use super::snapshot::{PositionView, StatusSnapshot, TradeStats};
use crate::error::BotError;
use crate::exchange::ExchangeGateway;
use crate::settings::StrategySettings;
use crate::Result;

/// Authoritative map of symbol -> position.
///
/// Only the control loop holds a `&mut PositionStore`; everyone else reads
/// snapshots.
pub struct PositionStore {
    pub(super) gateway: Arc<dyn ExchangeGateway>,
    pub(super) strategy: StrategySettings,
    max_positions: usize,
    positions: BTreeMap<String, Position>,
    stats: TradeStats,
}

impl PositionStore {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        strategy: StrategySettings,
        max_positions: usize,
    ) -> Self {
        Self {
            gateway,
            strategy,
            max_positions,
            positions: BTreeMap::new(),
            stats: TradeStats::default(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.positions.keys().cloned().collect()
    }

    /// Opening, Active and HalfClosed positions
    pub fn open_count(&self) -> usize {
        self.positions.values().filter(|p| p.status().is_open()).count()
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn stats(&self) -> &TradeStats {
        &self.stats
    }

    pub fn strategy(&self) -> &StrategySettings {
        &self.strategy
    }

    pub(super) fn get_mut(&mut self, symbol: &str) -> Result<&mut Position> {
        self.positions
            .get_mut(symbol)
            .ok_or_else(|| BotError::PositionNotFound(symbol.to_string()))
    }

    /// Reserve the symbol while its entry order is in flight
    pub(super) fn insert_opening(&mut self, symbol: &str, now: DateTime<Utc>) -> Result<()> {
        if self.positions.contains_key(symbol) {
            return Err(BotError::DuplicatePosition(symbol.to_string()));
        }
        if self.open_count() >= self.max_positions {
            return Err(BotError::CapacityExceeded {
                max: self.max_positions,
            });
        }
        self.positions
            .insert(symbol.to_string(), Position::opening(symbol, now));
        Ok(())
    }

    /// Drop a placeholder whose entry never filled
    pub(super) fn discard_opening(&mut self, symbol: &str) {
        if let Some(position) = self.positions.get(symbol) {
            if position.status() == PositionStatus::Opening {
                self.positions.remove(symbol);
            }
        }
    }

    /// Recovered positions bypass the capacity check: they already exist on the exchange
    pub(super) fn insert_recovered(&mut self, position: Position) -> Result<()> {
        let symbol = position.symbol().to_string();
        if self.positions.contains_key(&symbol) {
            return Err(BotError::DuplicatePosition(symbol));
        }
        self.positions.insert(symbol, position);
        Ok(())
    }

    /// Append a step at the next ladder rung.
    ///
    /// Opening becomes Active; any other status is kept.
    pub fn upsert_step(&mut self, symbol: &str, quantity: f64, price: f64) -> Result<()> {
        self.upsert_step_at(symbol, quantity, price, Utc::now())
    }

    pub fn upsert_step_at(
        &mut self,
        symbol: &str,
        quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !(quantity > 0.0) || !(price > 0.0) {
            return Err(BotError::OrderRejected {
                symbol: symbol.to_string(),
                reason: format!("invalid fill {} @ {}", quantity, price),
            });
        }

        let rungs = self.strategy.ladder.len();
        let next_index = self.get(symbol).map(|p| p.steps().len());
        let margin = match next_index {
            None => return Err(BotError::PositionNotFound(symbol.to_string())),
            Some(index) => self
                .strategy
                .rung(index)
                .ok_or_else(|| BotError::LadderExhausted {
                    symbol: symbol.to_string(),
                    rungs,
                })?,
        };

        let position = self.get_mut(symbol)?;
        if !position.status().is_open() {
            return Err(BotError::InvalidTransition {
                symbol: symbol.to_string(),
                from: position.status(),
                to: position.status(),
            });
        }

        position.push_step(quantity, price, margin, now);
        if position.status() == PositionStatus::Opening {
            position.set_status(PositionStatus::Active)?;
        }

        tracing::debug!(
            symbol,
            step = position.step_index(),
            quantity,
            price,
            avg = position.average_entry_price(),
            "Recorded step"
        );
        Ok(())
    }

    /// Quantity a half-close would buy back, or `None` if this step count was
    /// already half-closed
    pub fn plan_half_close(&self, symbol: &str) -> Result<Option<f64>> {
        let position = self
            .get(symbol)
            .ok_or_else(|| BotError::PositionNotFound(symbol.to_string()))?;

        if position.half_closed_at_steps() == Some(position.steps().len()) {
            return Ok(None);
        }
        if !matches!(
            position.status(),
            PositionStatus::Active | PositionStatus::HalfClosed
        ) {
            return Err(BotError::InvalidTransition {
                symbol: symbol.to_string(),
                from: position.status(),
                to: PositionStatus::HalfClosed,
            });
        }

        let quantity = self
            .gateway
            .round_quantity(symbol, position.total_quantity() / 2.0);
        if quantity <= 0.0 {
            return Err(BotError::Precision {
                symbol: symbol.to_string(),
                reason: format!(
                    "half of {} rounds to zero",
                    position.total_quantity()
                ),
            });
        }
        Ok(Some(quantity))
    }

    /// Record a half-close fill. Returns the realized PnL.
    pub(super) fn record_half_close(
        &mut self,
        symbol: &str,
        quantity: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let position = self.get_mut(symbol)?;
        position.mark_half_closed()?;
        let pnl = position.push_closing(quantity, price, now);
        self.stats.record(pnl);
        Ok(pnl)
    }

    /// Halve the position's book at `price`.
    ///
    /// Returns `false` without changing anything when this step count was
    /// already half-closed.
    pub fn apply_half_close(&mut self, symbol: &str, price: f64) -> Result<bool> {
        match self.plan_half_close(symbol)? {
            None => Ok(false),
            Some(quantity) => {
                self.record_half_close(symbol, quantity, price, Utc::now())?;
                Ok(true)
            }
        }
    }

    /// Book the buy-back of whatever is left. Returns the realized PnL of this fill.
    pub(super) fn record_final_close(
        &mut self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let position = self.get_mut(symbol)?;
        let remaining = position.total_quantity();
        if remaining <= QUANTITY_EPSILON {
            return Ok(0.0);
        }
        let pnl = position.push_closing(remaining, price, now);
        self.stats.record(pnl);
        Ok(pnl)
    }

    /// Delete a fully closed position
    pub fn remove(&mut self, symbol: &str, terminal: PositionStatus) -> Result<Position> {
        if !terminal.is_terminal() {
            return Err(BotError::InvalidTransition {
                symbol: symbol.to_string(),
                from: self
                    .get(symbol)
                    .map(|p| p.status())
                    .unwrap_or(PositionStatus::Active),
                to: terminal,
            });
        }

        self.get_mut(symbol)?.set_status(terminal)?;
        self.positions
            .remove(symbol)
            .ok_or_else(|| BotError::PositionNotFound(symbol.to_string()))
    }

    /// Immutable copy with unrealized PnL at `marks`
    pub fn snapshot(
        &self,
        marks: &HashMap<String, f64>,
        balance: f64,
        running: bool,
        cycle_count: u64,
    ) -> StatusSnapshot {
        let positions: BTreeMap<String, PositionView> = self
            .positions
            .values()
            .filter(|p| p.status() != PositionStatus::Opening)
            .map(|p| {
                let mark = marks.get(p.symbol()).copied();
                let view = PositionView {
                    symbol: p.symbol().to_string(),
                    status: p.status(),
                    step: p.step_index(),
                    total_margin: p.total_margin(),
                    average_entry: p.average_entry_price(),
                    total_quantity: p.total_quantity(),
                    mark_price: mark,
                    unrealized_pnl: mark.map(|m| p.unrealized_pnl(m)).unwrap_or(0.0),
                    realized_pnl: p.realized_pnl(),
                    recovered: p.is_recovered(),
                };
                (p.symbol().to_string(), view)
            })
            .collect();

        StatusSnapshot {
            active_positions: positions.len(),
            total_unrealized_pnl: positions.values().map(|v| v.unrealized_pnl).sum(),
            positions,
            balance,
            running,
            stats: self.stats.clone(),
            cycle_count,
            updated_at: Utc::now(),
        }
    }
}
