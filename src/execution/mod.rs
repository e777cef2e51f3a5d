// Position lifecycle: model, store, order execution and exchange reconciliation
pub mod orders;
pub mod position;
pub mod position_store;
pub mod reconcile;
pub mod snapshot;

pub use position::{
    ClosingFill, Position, PositionStatus, ProtectiveKind, ProtectiveOrder, ProtectiveOrders, Step,
};
pub use position_store::PositionStore;
pub use reconcile::{infer_step, RecoveryReport, ResyncReport, StepInference};
pub use snapshot::{PositionView, SnapshotHandle, StatusSnapshot, TradeStats};

/// What the strategy engine wants done to one position this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    EmergencyClose,
    Close,
    HalfClose,
    AddStep,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Applied { realized_pnl: f64 },
    Skipped(String),
}
