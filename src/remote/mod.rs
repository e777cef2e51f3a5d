// Remote control channel: dashboard commands in, state and logs out
pub mod log_shipper;
pub mod offline;
pub mod postgres;
pub mod publisher;

pub use log_shipper::{log_channel, spawn_log_worker, LogRecord, RemoteLogLayer};
pub use offline::OfflineControl;
pub use postgres::PostgresControl;
pub use publisher::StatePublisher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::BotError;
use crate::execution::StatusSnapshot;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Start,
    Stop,
}

impl FromStr for CommandKind {
    type Err = BotError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "START" => Ok(CommandKind::Start),
            "STOP" => Ok(CommandKind::Stop),
            other => Err(BotError::InvalidData(format!("unknown command '{}'", other))),
        }
    }
}

/// A command already marked consumed on the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCommand {
    pub id: i64,
    pub kind: CommandKind,
}

#[async_trait]
pub trait RemoteControl: Send + Sync {
    /// Pending commands, oldest first. Returned ids are consumed atomically
    /// and will not be handed out again.
    async fn poll_commands(&self) -> Result<Vec<RemoteCommand>>;

    async fn push_state(&self, snapshot: &StatusSnapshot) -> Result<()>;

    async fn push_log(&self, level: &str, message: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_kind() {
        assert_eq!("START".parse::<CommandKind>().unwrap(), CommandKind::Start);
        assert_eq!(" stop ".parse::<CommandKind>().unwrap(), CommandKind::Stop);
        assert!("RESTART".parse::<CommandKind>().is_err());
    }
}
