use tokio::time::{Duration, Instant};

/// Next bounded wait on the way to `deadline`, or `None` once it has passed
pub fn next_sub_wait(now: Instant, deadline: Instant, tick: Duration) -> Option<Duration> {
    if now >= deadline {
        return None;
    }
    let remaining = deadline - now;
    Some(remaining.min(tick.max(Duration::from_millis(1))))
}
