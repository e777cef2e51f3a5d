use async_trait::async_trait;

use super::{RemoteCommand, RemoteControl};
use crate::execution::StatusSnapshot;
use crate::Result;

/// Used when no database is configured: no commands, state and logs go nowhere
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineControl;

#[async_trait]
impl RemoteControl for OfflineControl {
    async fn poll_commands(&self) -> Result<Vec<RemoteCommand>> {
        Ok(Vec::new())
    }

    async fn push_state(&self, _snapshot: &StatusSnapshot) -> Result<()> {
        Ok(())
    }

    async fn push_log(&self, _level: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}
