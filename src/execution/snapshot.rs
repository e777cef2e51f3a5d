use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::position::PositionStatus;

/// Results of realized trades since startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub realized_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub break_evens: u32,
    pub gross_profit: f64,
    pub gross_loss: f64,
}

impl TradeStats {
    const BREAK_EVEN: f64 = 1e-9;

    pub fn record(&mut self, pnl: f64) {
        self.realized_pnl += pnl;
        if pnl > Self::BREAK_EVEN {
            self.wins += 1;
            self.gross_profit += pnl;
        } else if pnl < -Self::BREAK_EVEN {
            self.losses += 1;
            self.gross_loss += -pnl;
        } else {
            self.break_evens += 1;
        }
    }

    pub fn trades(&self) -> u32 {
        self.wins + self.losses + self.break_evens
    }

    pub fn win_rate(&self) -> f64 {
        let decided = self.wins + self.losses;
        if decided == 0 {
            0.0
        } else {
            self.wins as f64 / decided as f64
        }
    }
}

/// Read-only view of one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub status: PositionStatus,
    /// Zero-based ladder rung
    pub step: usize,
    pub total_margin: f64,
    pub average_entry: f64,
    pub total_quantity: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub recovered: bool,
}

/// Immutable copy of the bot's state for observers and the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub positions: BTreeMap<String, PositionView>,
    pub active_positions: usize,
    pub balance: f64,
    pub running: bool,
    pub total_unrealized_pnl: f64,
    pub stats: TradeStats,
    pub cycle_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            positions: BTreeMap::new(),
            active_positions: 0,
            balance: 0.0,
            running: false,
            total_unrealized_pnl: 0.0,
            stats: TradeStats::default(),
            cycle_count: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Shared handle to the latest snapshot; the lock is held only for the swap or the clone
#[derive(Debug, Clone, Default)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl SnapshotHandle {
    pub fn publish(&self, snapshot: StatusSnapshot) {
        match self.inner.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    pub fn latest(&self) -> StatusSnapshot {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_stats_buckets() {
        let mut stats = TradeStats::default();
        stats.record(12.5);
        stats.record(-4.0);
        stats.record(0.0);

        assert_eq!(stats.trades(), 3);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.break_evens, 1);
        assert!((stats.realized_pnl - 8.5).abs() < 1e-9);
        assert!((stats.gross_loss - 4.0).abs() < 1e-9);
        assert_eq!(stats.win_rate(), 0.5);
    }

    #[test]
    fn test_handle_publishes_latest() {
        let handle = SnapshotHandle::default();
        let observer = handle.clone();

        handle.publish(StatusSnapshot {
            running: true,
            cycle_count: 7,
            ..Default::default()
        });

        let latest = observer.latest();
        assert!(latest.running);
        assert_eq!(latest.cycle_count, 7);
    }
}
