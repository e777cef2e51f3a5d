use chrono::Utc;
use std::collections::HashMap;

use super::position::{Position, PositionStatus, ProtectiveKind, ProtectiveOrder};
use super::position_store::PositionStore;
use crate::error::BotError;
use crate::models::{ExchangePosition, OpenOrder};
use crate::Result;

/// Outcome of matching an observed margin against the ladder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepInference {
    /// Zero-based rung
    pub index: usize,
    /// Observed margin is within tolerance of that rung's prefix sum
    pub exact: bool,
}

/// Index of the largest ladder prefix sum not exceeding `observed_margin`.
///
/// `tolerance` is relative slack for fees and funding that shave a little off
/// the margin (0.05 lets 23.75 match a 25.0 prefix). Margins below the first
/// rung map to step 0, margins past the full ladder to the last rung; both are
/// reported as inexact.
pub fn infer_step(observed_margin: f64, ladder: &[f64], tolerance: f64) -> StepInference {
    let mut cumulative = 0.0;
    let mut matched: Option<(usize, f64)> = None;

    for (index, rung) in ladder.iter().enumerate() {
        cumulative += rung;
        if cumulative * (1.0 - tolerance) <= observed_margin {
            matched = Some((index, cumulative));
        } else {
            break;
        }
    }

    match matched {
        None => StepInference {
            index: 0,
            exact: false,
        },
        Some((index, prefix)) => StepInference {
            index,
            exact: (observed_margin - prefix).abs() <= prefix * tolerance,
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub recovered: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResyncReport {
    /// Gone from the exchange (closed by a stop, liquidation or by hand)
    pub removed: Vec<String>,
    /// Subset of `removed` whose stop-loss filled, with the PnL booked at the trigger
    pub stopped_out: Vec<(String, f64)>,
    /// Basis re-anchored after drift
    pub refreshed: Vec<String>,
    /// Unknown exchange shorts now under management
    pub adopted: Vec<String>,
    pub warnings: Vec<String>,
}

impl ResyncReport {
    pub fn is_quiet(&self) -> bool {
        self.removed.is_empty()
            && self.refreshed.is_empty()
            && self.adopted.is_empty()
            && self.warnings.is_empty()
    }
}

impl PositionStore {
    /// Rebuild the store from the exchange after a restart.
    ///
    /// Ambiguity never drops a symbol: it is recovered at the best guess and a
    /// warning is reported. Gateway failures are returned.
    pub async fn recover(&mut self) -> Result<RecoveryReport> {
        let exchange_positions = self.gateway.account_positions().await?;
        let orders = self.gateway.open_orders(None).await?;

        let mut report = RecoveryReport::default();
        for exchange_position in &exchange_positions {
            if exchange_position.quantity() <= 0.0 || self.contains(&exchange_position.symbol) {
                continue;
            }
            match self.adopt(exchange_position, &orders) {
                Ok(warnings) => {
                    report.recovered.push(exchange_position.symbol.clone());
                    report.warnings.extend(warnings);
                }
                Err(e) => report.warnings.push(e.to_string()),
            }
        }

        if self.open_count() > self.max_positions() {
            report.warnings.push(format!(
                "{} positions recovered but max_positions is {}; no new entries until below",
                self.open_count(),
                self.max_positions()
            ));
        }

        for warning in &report.warnings {
            tracing::warn!("⚠️ Recovery: {}", warning);
        }
        tracing::info!(
            "♻️ Recovered {} position(s) from exchange",
            report.recovered.len()
        );

        Ok(report)
    }

    /// Re-read exchange truth and fold it into the store
    pub async fn resync(&mut self) -> Result<ResyncReport> {
        let exchange_positions = self.gateway.account_positions().await?;
        let live: HashMap<&str, &ExchangePosition> = exchange_positions
            .iter()
            .filter(|p| p.quantity() > 0.0)
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        let mut report = ResyncReport::default();

        let gone: Vec<String> = self
            .positions()
            .filter(|p| p.status() != PositionStatus::Opening && !live.contains_key(p.symbol()))
            .map(|p| p.symbol().to_string())
            .collect();

        let unknown: Vec<&ExchangePosition> = live
            .values()
            .filter(|p| !self.contains(&p.symbol))
            .copied()
            .collect();

        let orders = if gone.is_empty() && unknown.is_empty() {
            Vec::new()
        } else {
            self.gateway.open_orders(None).await?
        };

        for symbol in gone {
            if let Some(pnl) = self.retire_external(&symbol, &orders).await {
                report.stopped_out.push((symbol.clone(), pnl));
            }
            report.removed.push(symbol);
        }

        let tolerance = self.strategy.resync_drift_tolerance;
        for symbol in self.symbols() {
            let Some(exchange_position) = live.get(symbol.as_str()) else {
                continue;
            };
            let Ok(position) = self.get_mut(&symbol) else {
                continue;
            };
            if drifted(position.total_quantity(), exchange_position.quantity(), tolerance)
                || drifted(
                    position.average_entry_price(),
                    exchange_position.entry_price,
                    tolerance,
                )
            {
                tracing::info!(
                    "🔄 Re-anchoring {}: qty {} -> {}, avg {} -> {}",
                    symbol,
                    position.total_quantity(),
                    exchange_position.quantity(),
                    position.average_entry_price(),
                    exchange_position.entry_price
                );
                position.reanchor(exchange_position.quantity(), exchange_position.entry_price);
                report.refreshed.push(symbol);
            }
        }

        for exchange_position in unknown {
            match self.adopt(exchange_position, &orders) {
                Ok(warnings) => {
                    tracing::info!("📥 Adopted {} from exchange", exchange_position.symbol);
                    report.adopted.push(exchange_position.symbol.clone());
                    report.warnings.extend(warnings);
                }
                Err(e) => report.warnings.push(e.to_string()),
            }
        }

        for warning in &report.warnings {
            tracing::warn!("⚠️ Resync: {}", warning);
        }

        Ok(report)
    }

    /// Drop a position the exchange no longer holds, cancelling only the
    /// protective orders still listed as open.
    ///
    /// A tracked stop-loss that is no longer listed is taken as filled: the
    /// remainder is booked at its trigger and the position ends EmergencyClosed.
    /// Returns the PnL booked that way.
    async fn retire_external(&mut self, symbol: &str, open_orders: &[OpenOrder]) -> Option<f64> {
        let listed = |order_id: i64| {
            open_orders
                .iter()
                .any(|open| open.symbol == symbol && open.order_id == order_id)
        };

        let (still_open, stop_fill) = match self.get(symbol) {
            Some(position) => {
                let still_open: Vec<i64> = position
                    .protective_orders()
                    .iter()
                    .filter(|o| listed(o.order_id))
                    .map(|o| o.order_id)
                    .collect();
                let stop_fill = position
                    .protective_orders()
                    .get(ProtectiveKind::StopLoss)
                    .filter(|stop| !listed(stop.order_id))
                    .and_then(|stop| stop.trigger_price);
                (still_open, stop_fill)
            }
            None => return None,
        };

        for order_id in still_open {
            if let Err(e) = self.gateway.cancel_order(symbol, order_id).await {
                tracing::warn!("Failed to cancel leftover order {} on {}: {}", order_id, symbol, e);
            }
        }

        let realized = match stop_fill {
            Some(trigger) => match self.record_final_close(symbol, trigger, Utc::now()) {
                Ok(pnl) => Some(pnl),
                Err(e) => {
                    tracing::warn!("Failed to book stop fill on {}: {}", symbol, e);
                    None
                }
            },
            None => None,
        };
        let terminal = if realized.is_some() {
            PositionStatus::EmergencyClosed
        } else {
            PositionStatus::Closed
        };

        match self.remove(symbol, terminal) {
            Ok(position) => match (realized, stop_fill) {
                (Some(pnl), Some(trigger)) => tracing::warn!(
                    "🚨 {} stopped out on the exchange at {} (step {}, avg {}) | PnL ${:.2}",
                    symbol,
                    trigger,
                    position.step_index(),
                    position.average_entry_price(),
                    pnl
                ),
                _ => tracing::warn!(
                    "🔚 {} closed outside the bot at step {} (avg {})",
                    symbol,
                    position.step_index(),
                    position.average_entry_price()
                ),
            },
            Err(e) => tracing::warn!("Failed to remove {}: {}", symbol, e),
        }

        realized
    }

    /// Insert one exchange position at its inferred rung. Returns warnings.
    fn adopt(
        &mut self,
        exchange_position: &ExchangePosition,
        orders: &[OpenOrder],
    ) -> Result<Vec<String>> {
        let symbol = exchange_position.symbol.as_str();
        if !exchange_position.is_short() {
            return Err(BotError::Reconciliation {
                symbol: symbol.to_string(),
                reason: "long position is not managed by this strategy, skipped".to_string(),
            });
        }

        let mut warnings = Vec::new();
        let symbol_orders: Vec<&OpenOrder> = orders.iter().filter(|o| o.symbol == symbol).collect();

        let margin = exchange_position.margin();
        let inference = infer_step(
            margin,
            &self.strategy.ladder,
            self.strategy.recovery_margin_tolerance,
        );
        let mut index = inference.index;

        if !inference.exact {
            warnings.push(format!(
                "{} margin ${:.2} matches no ladder prefix; assuming step {}",
                symbol, margin, index
            ));
        }
        if index > 0 && symbol_orders.is_empty() {
            warnings.push(format!(
                "{} looks like step {} but no working order corroborates it; assuming step 0",
                symbol, index
            ));
            index = 0;
        }

        let mut position = Position::recovered(
            symbol,
            exchange_position.quantity(),
            exchange_position.entry_price,
            index,
            &self.strategy.ladder,
            Utc::now(),
        );

        for order in symbol_orders {
            let Some(protective) = ProtectiveOrder::from_open_order(order) else {
                continue;
            };
            if let Some(replaced) = position.protective_orders_mut().set(protective) {
                warnings.push(format!(
                    "{} has more than one {:?} order; tracking the latest, ignoring {}",
                    symbol, replaced.kind, replaced.order_id
                ));
            }
        }

        tracing::info!(
            "♻️ {} | step {} | qty {} | avg {} | margin ${:.2}",
            symbol,
            index,
            position.total_quantity(),
            position.average_entry_price(),
            margin
        );

        self.insert_recovered(position)?;
        Ok(warnings)
    }
}

fn drifted(local: f64, exchange: f64, tolerance: f64) -> bool {
    let scale = exchange.abs().max(local.abs()).max(f64::MIN_POSITIVE);
    (local - exchange).abs() / scale > tolerance
}
