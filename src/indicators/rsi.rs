use crate::models::Kline;

/// Calculate Relative Strength Index (RSI)
///
/// Simple average of gains and losses over the last `period` close-to-close
/// changes, 0-100. Pumped coins above 70 are overbought enough to short.
///
/// Returns `None` with fewer than `period + 1` closes, and 100 when there were
/// no losses in the window.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let window = &closes[closes.len() - (period + 1)..];
    let (gains, losses) = window
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .fold((0.0, 0.0), |(gains, losses), change| {
            if change > 0.0 {
                (gains + change, losses)
            } else {
                (gains, losses - change)
            }
        });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Close prices, oldest first
pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_known_ratio() {
        // 19 of gains against 6 of losses over 14 changes -> RS 19/6 -> RSI 76
        let mut prices = vec![100.0];
        for change in [2.0, 2.0, -1.5, 2.0, 2.0, 2.0, -1.5, 2.0, 2.0, -1.5, 2.0, 1.0, -1.5, 2.0] {
            let last = *prices.last().unwrap();
            prices.push(last + change);
        }

        let rsi = calculate_rsi(&prices, 14).unwrap();
        assert!((rsi - 76.0).abs() < 1e-9, "rsi = {}", rsi);
    }

    #[test]
    fn test_rsi_uses_only_last_period_changes() {
        // A crash before the window must not drag the value down
        let mut prices = vec![200.0, 100.0];
        prices.extend((1..=5).map(|i| 100.0 + i as f64));
        assert_eq!(calculate_rsi(&prices, 5), Some(100.0));
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        assert!(calculate_rsi(&prices, 14).is_none());
        assert!(calculate_rsi(&prices, 0).is_none());
    }

    #[test]
    fn test_rsi_all_losses() {
        let prices = vec![105.0, 104.0, 103.0, 102.0, 101.0, 100.0];
        assert_eq!(calculate_rsi(&prices, 5), Some(0.0));
    }
}
