// Entry admission: position count, capital, daily loss and dynamic blacklist
pub mod blacklist;
pub mod gate;

pub use blacklist::DynamicBlacklist;
pub use gate::{AdmissionDenied, DailyLedger, RiskGate};
