use chrono::{DateTime, Duration, Utc};

use super::RemoteControl;
use crate::execution::StatusSnapshot;

/// Throttles state pushes to at most one per `min_interval`
#[derive(Debug, Clone)]
pub struct StatePublisher {
    min_interval: Duration,
    last_push: Option<DateTime<Utc>>,
}

impl StatePublisher {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval: Duration::milliseconds(min_interval_ms as i64),
            last_push: None,
        }
    }

    pub fn due(&self, now: DateTime<Utc>) -> bool {
        match self.last_push {
            None => true,
            Some(last) => now - last >= self.min_interval,
        }
    }

    /// Push if due. Returns whether a push was attempted.
    ///
    /// A failed push is logged and still counts, so a dead sink is retried on
    /// the throttle schedule rather than every iteration.
    pub async fn publish_at(
        &mut self,
        remote: &dyn RemoteControl,
        snapshot: &StatusSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.due(now) {
            return false;
        }
        self.last_push = Some(now);

        if let Err(e) = remote.push_state(snapshot).await {
            tracing::warn!("☁️ State push failed: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OfflineControl;

    #[tokio::test]
    async fn test_throttles_to_interval() {
        let mut publisher = StatePublisher::new(1000);
        let snapshot = StatusSnapshot::default();
        let start = Utc::now();

        assert!(publisher.publish_at(&OfflineControl, &snapshot, start).await);
        assert!(
            !publisher
                .publish_at(&OfflineControl, &snapshot, start + Duration::milliseconds(400))
                .await
        );
        assert!(
            publisher
                .publish_at(&OfflineControl, &snapshot, start + Duration::milliseconds(1000))
                .await
        );
    }
}
