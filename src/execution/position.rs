use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BotError;
use crate::models::{OpenOrder, OrderKind, PositionSide};
use crate::Result;

/// Quantities below this are treated as flat
pub const QUANTITY_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Entry order in flight; never observable outside `open_position`
    Opening,
    Active,
    HalfClosed,
    Closed,
    EmergencyClosed,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            PositionStatus::Opening | PositionStatus::Active | PositionStatus::HalfClosed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::EmergencyClosed)
    }

    /// Statuses only move forward. Staying put is allowed so that adding a step
    /// to a half-closed position keeps it half-closed.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        match (self, next) {
            (Opening, Opening | Active) => true,
            (Active, Active | HalfClosed | Closed | EmergencyClosed) => true,
            (HalfClosed, HalfClosed | Closed | EmergencyClosed) => true,
            _ => false,
        }
    }
}

/// One martingale entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub quantity: f64,
    pub entry_price: f64,
    /// Ladder rung committed for this step, in quote currency
    pub margin: f64,
    pub timestamp: DateTime<Utc>,
    /// Synthesised by recovery rather than observed as a fill
    pub inferred: bool,
    #[serde(skip)]
    seq: u64,
}

/// Partial buy-back recorded by a half-close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingFill {
    pub quantity: f64,
    pub price: f64,
    pub realized_pnl: f64,
    /// Step count when the close happened
    pub after_steps: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

/// Exchange-reported size and average that replaces local history up to `seq`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Basis {
    quantity: f64,
    average_entry_price: f64,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectiveKind {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl ProtectiveKind {
    pub fn from_order_kind(kind: &OrderKind) -> Option<Self> {
        match kind {
            OrderKind::StopMarket => Some(ProtectiveKind::StopLoss),
            OrderKind::TakeProfitMarket => Some(ProtectiveKind::TakeProfit),
            OrderKind::TrailingStopMarket => Some(ProtectiveKind::TrailingStop),
            _ => None,
        }
    }
}

/// A working exchange order guarding a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrder {
    pub kind: ProtectiveKind,
    pub order_id: i64,
    pub trigger_price: Option<f64>,
}

impl ProtectiveOrder {
    pub fn from_open_order(order: &OpenOrder) -> Option<Self> {
        Some(Self {
            kind: ProtectiveKind::from_order_kind(&order.kind)?,
            order_id: order.order_id,
            trigger_price: order.trigger_price,
        })
    }
}

/// At most one of each kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    pub stop_loss: Option<ProtectiveOrder>,
    pub take_profit: Option<ProtectiveOrder>,
    pub trailing_stop: Option<ProtectiveOrder>,
}

impl ProtectiveOrders {
    fn slot(&mut self, kind: ProtectiveKind) -> &mut Option<ProtectiveOrder> {
        match kind {
            ProtectiveKind::StopLoss => &mut self.stop_loss,
            ProtectiveKind::TakeProfit => &mut self.take_profit,
            ProtectiveKind::TrailingStop => &mut self.trailing_stop,
        }
    }

    pub fn get(&self, kind: ProtectiveKind) -> Option<&ProtectiveOrder> {
        match kind {
            ProtectiveKind::StopLoss => self.stop_loss.as_ref(),
            ProtectiveKind::TakeProfit => self.take_profit.as_ref(),
            ProtectiveKind::TrailingStop => self.trailing_stop.as_ref(),
        }
    }

    /// Returns the order previously held in the same slot
    pub fn set(&mut self, order: ProtectiveOrder) -> Option<ProtectiveOrder> {
        self.slot(order.kind).replace(order)
    }

    pub fn take(&mut self, kind: ProtectiveKind) -> Option<ProtectiveOrder> {
        self.slot(kind).take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtectiveOrder> {
        [&self.stop_loss, &self.take_profit, &self.trailing_stop]
            .into_iter()
            .flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// A short position built from a ladder of steps.
///
/// Quantity and average entry are derived: a recovered or re-anchored position
/// starts from the exchange basis, then steps and closing fills recorded after
/// it are replayed in order. Nothing sets them directly.
#[derive(Debug, Clone)]
pub struct Position {
    id: Uuid,
    symbol: String,
    side: PositionSide,
    steps: Vec<Step>,
    closings: Vec<ClosingFill>,
    basis: Option<Basis>,
    average_entry_price: f64,
    total_quantity: f64,
    total_margin: f64,
    status: PositionStatus,
    protective_orders: ProtectiveOrders,
    half_closed_at_steps: Option<usize>,
    realized_pnl: f64,
    opened_at: DateTime<Utc>,
    last_action_at: DateTime<Utc>,
    next_seq: u64,
}

impl Position {
    pub(crate) fn opening(symbol: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: PositionSide::Short,
            steps: Vec::new(),
            closings: Vec::new(),
            basis: None,
            average_entry_price: 0.0,
            total_quantity: 0.0,
            total_margin: 0.0,
            status: PositionStatus::Opening,
            protective_orders: ProtectiveOrders::default(),
            half_closed_at_steps: None,
            realized_pnl: 0.0,
            opened_at: now,
            last_action_at: now,
            next_seq: 1,
        }
    }

    /// Rebuild a position from exchange truth.
    ///
    /// `step_index` rungs of inferred history are synthesised so the ladder
    /// continues from the right place; quantity and average come from the basis.
    pub(crate) fn recovered(
        symbol: &str,
        quantity: f64,
        average_entry_price: f64,
        step_index: usize,
        ladder: &[f64],
        now: DateTime<Utc>,
    ) -> Self {
        let mut position = Self::opening(symbol, now);
        let rungs = &ladder[..(step_index + 1).min(ladder.len())];
        let committed: f64 = rungs.iter().sum();

        for rung in rungs {
            let share = if committed > 0.0 { rung / committed } else { 0.0 };
            let seq = position.bump_seq();
            position.steps.push(Step {
                quantity: quantity * share,
                entry_price: average_entry_price,
                margin: *rung,
                timestamp: now,
                inferred: true,
                seq,
            });
        }

        position.basis = Some(Basis {
            quantity,
            average_entry_price,
            seq: position.next_seq - 1,
        });
        position.status = PositionStatus::Active;
        position.recompute();
        position
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Replay basis, then every step and closing fill recorded after it
    fn recompute(&mut self) {
        let (mut quantity, basis_avg, since) = match self.basis {
            Some(b) => (b.quantity, b.average_entry_price, b.seq),
            None => (0.0, 0.0, 0),
        };
        let mut cost = quantity * basis_avg;

        enum Event {
            Fill(f64, f64),
            Close(f64),
        }

        let mut events: Vec<(u64, Event)> = self
            .steps
            .iter()
            .filter(|s| s.seq > since)
            .map(|s| (s.seq, Event::Fill(s.quantity, s.entry_price)))
            .chain(
                self.closings
                    .iter()
                    .filter(|c| c.seq > since)
                    .map(|c| (c.seq, Event::Close(c.quantity))),
            )
            .collect();
        events.sort_by_key(|(seq, _)| *seq);

        let replayed = !events.is_empty();
        for (_, event) in events {
            match event {
                Event::Fill(q, p) => {
                    cost += q * p;
                    quantity += q;
                }
                Event::Close(q) => {
                    let closed = q.min(quantity);
                    if quantity > QUANTITY_EPSILON {
                        cost -= closed * (cost / quantity);
                    }
                    quantity -= closed;
                }
            }
        }

        if quantity <= QUANTITY_EPSILON {
            self.total_quantity = 0.0;
            self.average_entry_price = if replayed { 0.0 } else { basis_avg };
        } else if replayed {
            self.total_quantity = quantity;
            self.average_entry_price = cost / quantity;
        } else {
            self.total_quantity = quantity;
            self.average_entry_price = basis_avg;
        }
        self.total_margin = self.steps.iter().map(|s| s.margin).sum();
    }

    pub(crate) fn push_step(&mut self, quantity: f64, price: f64, margin: f64, now: DateTime<Utc>) {
        let seq = self.bump_seq();
        self.steps.push(Step {
            quantity,
            entry_price: price,
            margin,
            timestamp: now,
            inferred: false,
            seq,
        });
        self.last_action_at = now;
        self.recompute();
    }

    /// Record a buy-back and return its realized PnL
    pub(crate) fn push_closing(&mut self, quantity: f64, price: f64, now: DateTime<Utc>) -> f64 {
        let quantity = quantity.min(self.total_quantity);
        let realized_pnl = (self.average_entry_price - price) * quantity;
        let seq = self.bump_seq();
        self.closings.push(ClosingFill {
            quantity,
            price,
            realized_pnl,
            after_steps: self.steps.len(),
            timestamp: now,
            seq,
        });
        self.realized_pnl += realized_pnl;
        self.last_action_at = now;
        self.recompute();
        realized_pnl
    }

    /// Replace local history with the exchange's size and average
    pub(crate) fn reanchor(&mut self, quantity: f64, average_entry_price: f64) {
        self.basis = Some(Basis {
            quantity,
            average_entry_price,
            seq: self.next_seq - 1,
        });
        self.recompute();
    }

    pub(crate) fn set_status(&mut self, next: PositionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BotError::InvalidTransition {
                symbol: self.symbol.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn mark_half_closed(&mut self) -> Result<()> {
        self.set_status(PositionStatus::HalfClosed)?;
        self.half_closed_at_steps = Some(self.steps.len());
        Ok(())
    }

    pub(crate) fn protective_orders_mut(&mut self) -> &mut ProtectiveOrders {
        &mut self.protective_orders
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn side(&self) -> PositionSide {
        self.side
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Zero-based index of the current ladder rung
    pub fn step_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn closings(&self) -> &[ClosingFill] {
        &self.closings
    }

    pub fn average_entry_price(&self) -> f64 {
        self.average_entry_price
    }

    pub fn total_quantity(&self) -> f64 {
        self.total_quantity
    }

    pub fn total_margin(&self) -> f64 {
        self.total_margin
    }

    pub fn status(&self) -> PositionStatus {
        self.status
    }

    pub fn protective_orders(&self) -> &ProtectiveOrders {
        &self.protective_orders
    }

    pub fn half_closed_at_steps(&self) -> Option<usize> {
        self.half_closed_at_steps
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_action_at(&self) -> DateTime<Utc> {
        self.last_action_at
    }

    pub fn is_recovered(&self) -> bool {
        self.steps.iter().any(|s| s.inferred)
    }

    /// Short PnL at `mark`
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        (self.average_entry_price - mark) * self.total_quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_average_is_quantity_weighted() {
        let mut position = Position::opening("SOLUSDT", now());
        position.push_step(10.0, 100.0, 10.0, now());
        position.push_step(30.0, 120.0, 15.0, now());

        assert_eq!(position.total_quantity(), 40.0);
        assert!((position.average_entry_price() - 115.0).abs() < 1e-9);
        assert_eq!(position.total_margin(), 25.0);
    }

    #[test]
    fn test_closing_keeps_average_and_realizes_pnl() {
        let mut position = Position::opening("SOLUSDT", now());
        position.push_step(10.0, 100.0, 10.0, now());
        let pnl = position.push_closing(4.0, 90.0, now());

        assert!((pnl - 40.0).abs() < 1e-9);
        assert!((position.total_quantity() - 6.0).abs() < 1e-9);
        assert!((position.average_entry_price() - 100.0).abs() < 1e-9);
        assert_eq!(position.closings()[0].after_steps, 1);
    }

    #[test]
    fn test_recovered_reproduces_basis_exactly() {
        let ladder = [10.0, 15.0, 22.5];
        let position = Position::recovered("ARBUSDT", 123.456, 1.0987, 1, &ladder, now());

        assert_eq!(position.total_quantity(), 123.456);
        assert_eq!(position.average_entry_price(), 1.0987);
        assert_eq!(position.steps().len(), 2);
        assert!(position.steps().iter().all(|s| s.inferred));
        assert_eq!(position.total_margin(), 25.0);
        assert_eq!(position.status(), PositionStatus::Active);
    }

    #[test]
    fn test_steps_after_reanchor_replay_on_top_of_basis() {
        let ladder = [10.0, 15.0, 22.5];
        let mut position = Position::recovered("ARBUSDT", 10.0, 1.0, 0, &ladder, now());
        position.push_step(10.0, 2.0, 15.0, now());

        assert_eq!(position.total_quantity(), 20.0);
        assert!((position.average_entry_price() - 1.5).abs() < 1e-12);

        position.reanchor(19.5, 1.52);
        assert_eq!(position.total_quantity(), 19.5);
        assert_eq!(position.average_entry_price(), 1.52);
    }

    #[test]
    fn test_status_never_regresses() {
        use PositionStatus::*;
        assert!(Opening.can_transition_to(Active));
        assert!(HalfClosed.can_transition_to(HalfClosed));
        assert!(!HalfClosed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Opening.can_transition_to(HalfClosed));

        let mut position = Position::opening("SOLUSDT", now());
        assert!(position.set_status(PositionStatus::HalfClosed).is_err());
    }

    #[test]
    fn test_protective_slots_hold_one_of_each() {
        let mut orders = ProtectiveOrders::default();
        assert!(orders.is_empty());

        let first = ProtectiveOrder {
            kind: ProtectiveKind::StopLoss,
            order_id: 1,
            trigger_price: Some(1.5),
        };
        let second = ProtectiveOrder {
            order_id: 2,
            ..first.clone()
        };

        assert!(orders.set(first.clone()).is_none());
        assert_eq!(orders.set(second), Some(first));
        assert_eq!(orders.iter().count(), 1);
        assert_eq!(orders.take(ProtectiveKind::StopLoss).map(|o| o.order_id), Some(2));
    }
}
