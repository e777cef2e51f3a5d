// Core modules
pub mod control;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod remote;
pub mod risk;
pub mod settings;
pub mod signals;
pub mod simulation;
pub mod strategy;

// Re-export commonly used types
pub use error::{BotError, ErrorClass};
pub use models::*;
pub use settings::Settings;

// Error handling
pub type Result<T> = std::result::Result<T, BotError>;
