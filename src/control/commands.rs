use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc;

/// Remembers the most recent remote command ids so a re-delivered command is a no-op
#[derive(Debug, Clone)]
pub struct CommandLedger {
    capacity: usize,
    order: VecDeque<i64>,
    seen: HashSet<i64>,
}

impl CommandLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// True the first time an id is seen; the oldest id is forgotten once full
    pub fn first_sighting(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Commands raised in-process (CLI flag, Ctrl+C)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    Start,
    Stop,
    /// Leave the loop; exchange positions stay open
    Shutdown,
}

/// Cloneable sender into the control loop
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<LocalCommand>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LocalCommand>) -> Self {
        Self { tx }
    }

    pub fn start(&self) {
        self.send(LocalCommand::Start);
    }

    pub fn stop(&self) {
        self.send(LocalCommand::Stop);
    }

    pub fn shutdown(&self) {
        self.send(LocalCommand::Shutdown);
    }

    fn send(&self, command: LocalCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Control loop already gone, dropping {:?}", command);
        }
    }
}
