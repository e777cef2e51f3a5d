use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::execution::StatusSnapshot;
use crate::remote::{CommandKind, RemoteCommand, RemoteControl};
use crate::Result;

#[derive(Debug, Default)]
struct ControlState {
    next_id: i64,
    pending: Vec<RemoteCommand>,
    consumed: Vec<RemoteCommand>,
    states: Vec<StatusSnapshot>,
    logs: Vec<(String, String)>,
}

/// Remote channel kept in memory. Commands are consumed on poll like the
/// database-backed channel, but can be re-delivered on demand.
#[derive(Debug, Default)]
pub struct InMemoryControl {
    state: Mutex<ControlState>,
}

impl InMemoryControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a command as the dashboard would. Returns its id.
    pub fn enqueue(&self, kind: CommandKind) -> i64 {
        let mut state = self.lock();
        state.next_id += 1;
        let command = RemoteCommand {
            id: state.next_id,
            kind,
        };
        state.pending.push(command);
        command.id
    }

    /// Hand an already consumed command out again
    pub fn redeliver(&self, id: i64) -> bool {
        let mut state = self.lock();
        let found = state.consumed.iter().find(|c| c.id == id).copied();
        match found {
            Some(command) => {
                state.pending.push(command);
                true
            }
            None => false,
        }
    }

    pub fn pushed_states(&self) -> Vec<StatusSnapshot> {
        self.lock().states.clone()
    }

    pub fn logs(&self) -> Vec<(String, String)> {
        self.lock().logs.clone()
    }
}

#[async_trait]
impl RemoteControl for InMemoryControl {
    async fn poll_commands(&self) -> Result<Vec<RemoteCommand>> {
        let mut state = self.lock();
        let mut commands = std::mem::take(&mut state.pending);
        commands.sort_by_key(|c| c.id);
        state.consumed.extend(commands.iter().copied());
        Ok(commands)
    }

    async fn push_state(&self, snapshot: &StatusSnapshot) -> Result<()> {
        self.lock().states.push(snapshot.clone());
        Ok(())
    }

    async fn push_log(&self, level: &str, message: &str) -> Result<()> {
        self.lock()
            .logs
            .push((level.to_string(), message.to_string()));
        Ok(())
    }
}
