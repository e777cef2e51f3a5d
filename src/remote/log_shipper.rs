use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::RemoteControl;

const SHIPPED_TARGET: &str = "shortbot";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
}

/// Tracing layer forwarding the bot's INFO+ events to the remote `logs` sink.
///
/// Never blocks: when the queue is full the record is dropped.
pub struct RemoteLogLayer {
    tx: mpsc::Sender<LogRecord>,
}

/// Bounded queue between the tracing layer and the shipping worker
pub fn log_channel(capacity: usize) -> (RemoteLogLayer, mpsc::Receiver<LogRecord>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RemoteLogLayer { tx }, rx)
}

/// Drain the queue into `remote`. Sink errors are swallowed; logging them here
/// would feed straight back into the queue.
pub fn spawn_log_worker(
    mut rx: mpsc::Receiver<LogRecord>,
    remote: Arc<dyn RemoteControl>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let _ = remote.push_log(&record.level, &record.message).await;
        }
    })
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Level ordering is by verbosity: DEBUG and TRACE compare greater than INFO
        if *meta.level() > Level::INFO || !meta.target().starts_with(SHIPPED_TARGET) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: meta.level().to_string(),
            message: format!("{}{}", visitor.message, visitor.fields),
        };
        let _ = self.tx.try_send(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_ships_info_and_above_from_bot_target() {
        let (layer, mut rx) = log_channel(8);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "shortbot::execution", symbol = "PEPEUSDT", "Opened");
            tracing::debug!(target: "shortbot::execution", "too chatty");
            tracing::warn!(target: "sqlx::query", "not ours");
            tracing::error!(target: "shortbot", "boom");
        });

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, "INFO");
        assert_eq!(first.message, "Opened symbol=PEPEUSDT");

        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, "ERROR");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (layer, mut rx) = log_channel(1);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "shortbot", "one");
            tracing::info!(target: "shortbot", "two");
        });

        assert_eq!(rx.try_recv().unwrap().message, "one");
        assert!(rx.try_recv().is_err());
    }
}
