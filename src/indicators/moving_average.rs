/// Simple moving average of the last `period` values
pub fn calculate_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }

    let sum: f64 = values[values.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average seeded with the SMA of the first `period` values
pub fn calculate_ema(values: &[f64], period: usize) -> Option<f64> {
    let seed = calculate_sma(values.get(..period)?, period)?;
    let multiplier = 2.0 / (period as f64 + 1.0);

    Some(
        values[period..]
            .iter()
            .fold(seed, |ema, value| (value - ema) * multiplier + ema),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_takes_the_tail() {
        let closes = vec![1.0, 100.0, 102.0, 104.0];
        assert_eq!(calculate_sma(&closes, 3), Some(102.0));
    }

    #[test]
    fn test_ema_lags_a_rising_series() {
        let closes = vec![1.0, 1.1, 1.2, 1.35, 1.5, 1.7];
        let ema = calculate_ema(&closes, 3).unwrap();
        assert!(ema < 1.7);
        assert!(ema > calculate_sma(&closes[..3], 3).unwrap());
    }

    #[test]
    fn test_ema_insufficient_data() {
        assert!(calculate_ema(&[1.0, 2.0], 3).is_none());
        assert!(calculate_ema(&[1.0, 2.0], 0).is_none());
    }
}
