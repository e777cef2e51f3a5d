// Martingale short strategy: per-position decisions and entry admission
pub mod decision;
pub mod engine;

pub use decision::{decide, emergency_triggered};
pub use engine::{ActionSet, EntryRejection, StrategyEngine};
