use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::settings::BlacklistSettings;

/// Bars a symbol after repeated emergency closes
#[derive(Debug, Clone)]
pub struct DynamicBlacklist {
    enabled: bool,
    trigger: usize,
    window: Duration,
    duration: Duration,
    events: HashMap<String, VecDeque<DateTime<Utc>>>,
    banned_until: HashMap<String, DateTime<Utc>>,
}

impl DynamicBlacklist {
    pub fn new(settings: &BlacklistSettings) -> Self {
        Self {
            enabled: settings.enabled,
            trigger: settings.emergency_closes.max(1),
            window: Duration::hours(settings.window_hours),
            duration: Duration::hours(settings.duration_hours),
            events: HashMap::new(),
            banned_until: HashMap::new(),
        }
    }

    pub fn record_emergency_close(&mut self, symbol: &str, now: DateTime<Utc>) {
        if !self.enabled {
            return;
        }

        let events = self.events.entry(symbol.to_string()).or_default();
        events.push_back(now);
        while events.front().is_some_and(|t| now - *t > self.window) {
            events.pop_front();
        }

        if events.len() >= self.trigger {
            let until = now + self.duration;
            events.clear();
            self.banned_until.insert(symbol.to_string(), until);
            tracing::warn!("🚫 {} blacklisted until {}", symbol, until);
        }
    }

    /// Expiry of the ban, if `symbol` is currently barred
    pub fn banned_until(&self, symbol: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.banned_until
            .get(symbol)
            .copied()
            .filter(|until| *until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BlacklistSettings {
        BlacklistSettings {
            enabled: true,
            emergency_closes: 2,
            window_hours: 24,
            duration_hours: 12,
        }
    }

    #[test]
    fn test_bans_after_repeated_emergencies() {
        let mut blacklist = DynamicBlacklist::new(&settings());
        let start = Utc::now();

        blacklist.record_emergency_close("LUNAUSDT", start);
        assert!(blacklist.banned_until("LUNAUSDT", start).is_none());

        blacklist.record_emergency_close("LUNAUSDT", start + Duration::hours(1));
        let until = blacklist.banned_until("LUNAUSDT", start + Duration::hours(2));
        assert_eq!(until, Some(start + Duration::hours(13)));

        // Ban expires
        assert!(blacklist
            .banned_until("LUNAUSDT", start + Duration::hours(14))
            .is_none());
    }

    #[test]
    fn test_events_outside_window_do_not_count() {
        let mut blacklist = DynamicBlacklist::new(&settings());
        let start = Utc::now();

        blacklist.record_emergency_close("LUNAUSDT", start);
        blacklist.record_emergency_close("LUNAUSDT", start + Duration::hours(30));
        assert!(blacklist
            .banned_until("LUNAUSDT", start + Duration::hours(30))
            .is_none());
    }

    #[test]
    fn test_disabled_never_bans() {
        let mut blacklist = DynamicBlacklist::new(&BlacklistSettings {
            enabled: false,
            ..settings()
        });
        let now = Utc::now();
        for _ in 0..5 {
            blacklist.record_emergency_close("LUNAUSDT", now);
        }
        assert!(blacklist.banned_until("LUNAUSDT", now).is_none());
    }
}
