// Technical indicators used for entry filtering and the step circuit breaker
pub mod moving_average;
pub mod rsi;

pub use moving_average::{calculate_ema, calculate_sma};
pub use rsi::{calculate_rsi, closes};
