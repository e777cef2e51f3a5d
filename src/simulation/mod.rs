// In-memory doubles for the exchange, signal source and remote channel.
// Used by the test suites and for dry runs without credentials.
pub mod control;
pub mod exchange;
pub mod signals;

pub use control::InMemoryControl;
pub use exchange::SimulatedExchange;
pub use signals::ScriptedSignals;
