// Control loop: Standby/Trading state machine, command handling, cadence
pub mod commands;
pub mod control_loop;
pub mod scheduler;

pub use commands::{CommandLedger, ControlHandle, LocalCommand};
pub use control_loop::{Components, ControlLoop, Flow, RuntimeState};
pub use scheduler::next_sub_wait;
