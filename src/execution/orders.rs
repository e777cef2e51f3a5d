use chrono::{DateTime, Utc};

use super::position::{PositionStatus, ProtectiveKind, ProtectiveOrder};
use super::position_store::PositionStore;
use super::{ActionOutcome, PositionAction};
use crate::error::BotError;
use crate::models::{OrderSide, PumpCandidate, TimeInForce};
use crate::settings::StepOrderType;
use crate::Result;

impl PositionStore {
    /// Enter a new short at ladder rung 0.
    ///
    /// The symbol is reserved as Opening while the order is in flight. If the
    /// entry fails the reservation is dropped and no position exists.
    pub async fn open_position(&mut self, candidate: &PumpCandidate) -> Result<()> {
        let symbol = candidate.symbol.as_str();
        self.insert_opening(symbol, Utc::now())?;

        match self.execute_entry(candidate).await {
            Ok(()) => {
                self.refresh_protection(symbol).await;
                Ok(())
            }
            Err(e) => {
                self.discard_opening(symbol);
                Err(e)
            }
        }
    }

    async fn execute_entry(&mut self, candidate: &PumpCandidate) -> Result<()> {
        let symbol = candidate.symbol.as_str();
        let margin = self.strategy.rung(0).unwrap_or_default();
        let leverage = self.strategy.leverage;

        self.gateway.prepare_symbol(symbol, leverage).await?;

        let mark = match self.gateway.mark_price(symbol).await {
            Ok(price) => price,
            Err(e) if candidate.reference_price > 0.0 => {
                tracing::debug!("Mark price for {} unavailable ({}), using ticker", symbol, e);
                candidate.reference_price
            }
            Err(e) => return Err(e),
        };

        let quantity = self
            .gateway
            .round_quantity(symbol, margin * leverage as f64 / mark);
        if quantity <= 0.0 {
            return Err(BotError::Precision {
                symbol: symbol.to_string(),
                reason: format!("${} at {}x rounds to zero quantity at {}", margin, leverage, mark),
            });
        }

        let ack = self
            .gateway
            .place_market_order(symbol, OrderSide::Sell, quantity, false)
            .await?;
        let fill = ack.fill_price_or(mark);
        let filled = ack.filled_or(quantity);

        self.upsert_step(symbol, filled, fill)?;

        tracing::info!(
            "🔴 SHORT {} | pump +{:.1}% | {} @ {} | margin ${:.2}",
            symbol,
            candidate.pump_percent,
            filled,
            fill,
            margin
        );
        Ok(())
    }

    /// Execute one engine decision through the gateway
    pub async fn apply(
        &mut self,
        symbol: &str,
        action: PositionAction,
        mark: f64,
    ) -> Result<ActionOutcome> {
        let now = Utc::now();
        match action {
            PositionAction::AddStep => self.add_step(symbol, mark).await,
            PositionAction::HalfClose => self.half_close(symbol, mark, now).await,
            PositionAction::Close => self.close(symbol, mark, PositionStatus::Closed, now).await,
            PositionAction::EmergencyClose => {
                self.close(symbol, mark, PositionStatus::EmergencyClosed, now)
                    .await
            }
        }
    }

    async fn add_step(&mut self, symbol: &str, mark: f64) -> Result<ActionOutcome> {
        let index = self
            .get(symbol)
            .ok_or_else(|| BotError::PositionNotFound(symbol.to_string()))?
            .steps()
            .len();
        let margin = self
            .strategy
            .rung(index)
            .ok_or_else(|| BotError::LadderExhausted {
                symbol: symbol.to_string(),
                rungs: self.strategy.ladder.len(),
            })?;

        let quantity = self
            .gateway
            .round_quantity(symbol, margin * self.strategy.leverage as f64 / mark);
        if quantity <= 0.0 {
            return Err(BotError::Precision {
                symbol: symbol.to_string(),
                reason: format!("step {} margin ${} rounds to zero", index, margin),
            });
        }

        let ack = match self.strategy.step_order {
            StepOrderType::Market => {
                self.gateway
                    .place_market_order(symbol, OrderSide::Sell, quantity, false)
                    .await?
            }
            StepOrderType::LimitIoc => {
                let price = self.gateway.round_price(
                    symbol,
                    mark * (1.0 - self.strategy.limit_offset_percent / 100.0),
                );
                let ack = self
                    .gateway
                    .place_limit_order(symbol, OrderSide::Sell, quantity, price, TimeInForce::Ioc)
                    .await?;
                if ack.executed_qty <= 0.0 {
                    return Ok(ActionOutcome::Skipped(format!(
                        "IOC step at {} did not fill",
                        price
                    )));
                }
                ack
            }
        };

        let fill = ack.fill_price_or(mark);
        self.upsert_step(symbol, ack.filled_or(quantity), fill)?;

        if let Some(position) = self.get(symbol) {
            tracing::info!(
                "📈 STEP {} -> {} | +${:.2} @ {} | avg {:.6} | margin ${:.2}",
                symbol,
                position.step_index(),
                margin,
                fill,
                position.average_entry_price(),
                position.total_margin()
            );
        }

        self.refresh_protection(symbol).await;
        Ok(ActionOutcome::Applied { realized_pnl: 0.0 })
    }

    async fn half_close(
        &mut self,
        symbol: &str,
        mark: f64,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        let Some(quantity) = self.plan_half_close(symbol)? else {
            return Ok(ActionOutcome::Skipped("already half-closed at this step".into()));
        };

        let ack = self
            .gateway
            .place_market_order(symbol, OrderSide::Buy, quantity, true)
            .await?;
        let fill = ack.fill_price_or(mark);
        let pnl = self.record_half_close(symbol, ack.filled_or(quantity), fill, now)?;

        tracing::info!(
            "✂️ HALF CLOSE {} | {} @ {} | PnL ${:.2}",
            symbol,
            ack.filled_or(quantity),
            fill,
            pnl
        );

        self.refresh_protection(symbol).await;
        Ok(ActionOutcome::Applied { realized_pnl: pnl })
    }

    async fn close(
        &mut self,
        symbol: &str,
        mark: f64,
        terminal: PositionStatus,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        let remaining = self
            .get(symbol)
            .ok_or_else(|| BotError::PositionNotFound(symbol.to_string()))?
            .total_quantity();

        self.cancel_protection(symbol).await;

        let quantity = self.gateway.round_quantity(symbol, remaining);
        let fill = if quantity > 0.0 {
            match self
                .gateway
                .place_market_order(symbol, OrderSide::Buy, quantity, true)
                .await
            {
                Ok(ack) => ack.fill_price_or(mark),
                Err(e) => {
                    // Still open on the exchange, so put the stop back
                    self.refresh_protection(symbol).await;
                    return Err(e);
                }
            }
        } else {
            mark
        };

        let pnl = self.record_final_close(symbol, fill, now)?;
        let position = self.remove(symbol, terminal)?;

        let label = if terminal == PositionStatus::EmergencyClosed {
            "🚨 EMERGENCY CLOSE"
        } else {
            "✅ CLOSE"
        };
        tracing::info!(
            "{} {} | step {} | {} @ {} | PnL ${:.2} (position ${:.2})",
            label,
            symbol,
            position.step_index(),
            remaining,
            fill,
            pnl,
            position.realized_pnl()
        );

        Ok(ActionOutcome::Applied { realized_pnl: pnl })
    }

    /// Cancel every protective order the position holds. Failures are logged.
    pub(super) async fn cancel_protection(&mut self, symbol: &str) {
        let orders: Vec<ProtectiveOrder> = match self.get_mut(symbol) {
            Ok(position) => {
                let slots = position.protective_orders_mut();
                [
                    ProtectiveKind::StopLoss,
                    ProtectiveKind::TakeProfit,
                    ProtectiveKind::TrailingStop,
                ]
                .into_iter()
                .filter_map(|kind| slots.take(kind))
                .collect()
            }
            Err(_) => return,
        };

        for order in orders {
            if let Err(e) = self.gateway.cancel_order(symbol, order.order_id).await {
                tracing::warn!(
                    "Failed to cancel {:?} {} for {}: {}",
                    order.kind,
                    order.order_id,
                    symbol,
                    e
                );
            }
        }
    }

    /// Re-place protective orders for the current size and average.
    ///
    /// A failure here never undoes the fill that triggered it.
    pub(super) async fn refresh_protection(&mut self, symbol: &str) {
        let (quantity, average, status) = match self.get(symbol) {
            Some(p) => (p.total_quantity(), p.average_entry_price(), p.status()),
            None => return,
        };
        let quantity = self.gateway.round_quantity(symbol, quantity);
        if quantity <= 0.0 || average <= 0.0 {
            return;
        }

        let stop = self
            .gateway
            .round_price(symbol, average * (1.0 + self.strategy.max_adverse_excursion()));
        self.replace_protective(symbol, ProtectiveKind::StopLoss, quantity, stop)
            .await;

        if self.strategy.place_take_profit_order {
            let steps = self.get(symbol).map(|p| p.steps().len()).unwrap_or(1);
            let target = self.gateway.round_price(
                symbol,
                average * (1.0 - self.strategy.take_profit_fraction(steps)),
            );
            self.replace_protective(symbol, ProtectiveKind::TakeProfit, quantity, target)
                .await;
        }

        if self.strategy.trailing.enabled && status == PositionStatus::HalfClosed {
            let activation = self.gateway.round_price(
                symbol,
                average * (1.0 - self.strategy.trailing.activation_percent / 100.0),
            );
            self.replace_protective(symbol, ProtectiveKind::TrailingStop, quantity, activation)
                .await;
        }
    }

    async fn replace_protective(
        &mut self,
        symbol: &str,
        kind: ProtectiveKind,
        quantity: f64,
        price: f64,
    ) {
        let previous = match self.get_mut(symbol) {
            Ok(position) => position.protective_orders_mut().take(kind),
            Err(_) => return,
        };
        if let Some(previous) = previous {
            if let Err(e) = self.gateway.cancel_order(symbol, previous.order_id).await {
                tracing::warn!("Failed to cancel old {:?} for {}: {}", kind, symbol, e);
            }
        }

        let placed = match kind {
            ProtectiveKind::StopLoss => {
                self.gateway
                    .place_stop_order(symbol, OrderSide::Buy, quantity, price)
                    .await
            }
            ProtectiveKind::TakeProfit => {
                self.gateway
                    .place_take_profit_order(symbol, OrderSide::Buy, quantity, price)
                    .await
            }
            ProtectiveKind::TrailingStop => {
                self.gateway
                    .place_trailing_stop(
                        symbol,
                        OrderSide::Buy,
                        quantity,
                        self.strategy.trailing.callback_percent,
                        Some(price),
                    )
                    .await
            }
        };

        match placed {
            Ok(ack) => {
                if let Ok(position) = self.get_mut(symbol) {
                    position.protective_orders_mut().set(ProtectiveOrder {
                        kind,
                        order_id: ack.order_id,
                        trigger_price: Some(price),
                    });
                }
                tracing::debug!("🛡️ {:?} for {} at {}", kind, symbol, price);
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to place {:?} for {} at {}: {}", kind, symbol, price, e);
            }
        }
    }
}
