use chrono::{DateTime, Duration, Utc};

use crate::execution::{Position, PositionAction, PositionStatus};
use crate::settings::StrategySettings;

/// True once price has moved `max_adverse_excursion` away from the average, in
/// either direction. The boundary counts.
pub fn emergency_triggered(price: f64, average_entry: f64, max_adverse_excursion: f64) -> bool {
    average_entry > 0.0 && (price - average_entry).abs() / average_entry >= max_adverse_excursion
}

/// The single action for `position` at `price`, by priority:
/// emergency close, close, half-close, add step.
pub fn decide(
    position: &Position,
    price: f64,
    settings: &StrategySettings,
    now: DateTime<Utc>,
) -> Option<PositionAction> {
    if !matches!(
        position.status(),
        PositionStatus::Active | PositionStatus::HalfClosed
    ) {
        return None;
    }
    if !price.is_finite() || price <= 0.0 {
        return None;
    }

    let average = position.average_entry_price();
    if average <= 0.0 {
        return None;
    }
    let steps = position.steps().len();

    if emergency_triggered(price, average, settings.max_adverse_excursion()) {
        // A gap in our favour is a profitable exit, not an emergency
        if price < average {
            return Some(PositionAction::Close);
        }
        return Some(PositionAction::EmergencyClose);
    }

    if price <= average * (1.0 - settings.take_profit_fraction(steps)) {
        return Some(PositionAction::Close);
    }

    if price <= average
        && steps >= settings.half_close_min_steps
        && position.half_closed_at_steps() != Some(steps)
    {
        return Some(PositionAction::HalfClose);
    }

    if steps < settings.ladder.len() {
        let last = position.last_step()?;
        let trigger = last.entry_price * (1.0 + settings.step_distance(steps));
        let cooldown = Duration::seconds(settings.step_cooldown_secs as i64);
        if price >= trigger && now - position.last_action_at() >= cooldown {
            return Some(PositionAction::AddStep);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> StrategySettings {
        StrategySettings {
            ladder: vec![10.0, 15.0, 22.5],
            step_trigger_percent: 5.0,
            take_profit_percent: 1.5,
            max_adverse_excursion_percent: 50.0,
            half_close_min_steps: 2,
            ..Default::default()
        }
    }

    fn position(fills: &[(f64, f64)]) -> Position {
        let start = Utc::now() - Duration::hours(1);
        let mut position = Position::opening("PEPEUSDT", start);
        for (i, (quantity, price)) in fills.iter().enumerate() {
            position.push_step(*quantity, *price, settings().ladder[i], start);
        }
        position.set_status(PositionStatus::Active).unwrap();
        position
    }

    #[test]
    fn test_emergency_boundary_is_inclusive() {
        assert!(emergency_triggered(150.0, 100.0, 0.5));
        assert!(emergency_triggered(50.0, 100.0, 0.5));
        assert!(!emergency_triggered(149.99, 100.0, 0.5));
    }

    #[test]
    fn test_emergency_beats_everything() {
        let position = position(&[(1.0, 100.0)]);
        assert_eq!(
            decide(&position, 150.0, &settings(), Utc::now()),
            Some(PositionAction::EmergencyClose)
        );
    }

    #[test]
    fn test_favourable_gap_is_a_close() {
        let position = position(&[(1.0, 100.0)]);
        assert_eq!(
            decide(&position, 45.0, &settings(), Utc::now()),
            Some(PositionAction::Close)
        );
    }

    #[test]
    fn test_take_profit_close() {
        let position = position(&[(1.0, 100.0)]);
        assert_eq!(
            decide(&position, 98.4, &settings(), Utc::now()),
            Some(PositionAction::Close)
        );
        assert_eq!(decide(&position, 99.0, &settings(), Utc::now()), None);
    }

    #[test]
    fn test_half_close_needs_two_steps() {
        let single = position(&[(1.0, 100.0)]);
        assert_eq!(decide(&single, 100.0, &settings(), Utc::now()), None);

        let double = position(&[(1.0, 100.0), (1.0, 106.0)]);
        assert_eq!(
            decide(&double, 103.0, &settings(), Utc::now()),
            Some(PositionAction::HalfClose)
        );
    }

    #[test]
    fn test_half_close_not_repeated_at_same_step_count() {
        let mut position = position(&[(1.0, 100.0), (1.0, 106.0)]);
        position.mark_half_closed().unwrap();
        position.push_closing(1.0, 103.0, Utc::now());

        assert_eq!(decide(&position, 102.5, &settings(), Utc::now()), None);
    }

    #[test]
    fn test_add_step_from_last_entry() {
        let position = position(&[(1.0, 100.0)]);
        assert_eq!(
            decide(&position, 105.5, &settings(), Utc::now()),
            Some(PositionAction::AddStep)
        );
        assert_eq!(decide(&position, 104.9, &settings(), Utc::now()), None);
    }

    #[test]
    fn test_no_step_past_ladder_end() {
        let position = position(&[(1.0, 100.0), (1.0, 106.0), (1.0, 112.0)]);
        assert_eq!(decide(&position, 125.0, &settings(), Utc::now()), None);
    }

    #[test]
    fn test_step_cooldown() {
        let position = position(&[(1.0, 100.0)]);
        let strict = StrategySettings {
            step_cooldown_secs: 7200,
            ..settings()
        };
        assert_eq!(decide(&position, 106.0, &strict, Utc::now()), None);
    }

    #[test]
    fn test_ignores_opening_positions() {
        let position = Position::opening("PEPEUSDT", Utc::now());
        assert_eq!(decide(&position, 1.0, &settings(), Utc::now()), None);
    }
}
