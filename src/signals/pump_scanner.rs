use async_trait::async_trait;
use std::sync::Arc;

use super::{SignalSource, TrendVerdict};
use crate::exchange::ExchangeGateway;
use crate::indicators::{calculate_ema, closes};
use crate::models::PumpCandidate;
use crate::settings::ScannerSettings;
use crate::Result;

/// Pump detection over the gateway's 24h tickers, trend check over hourly candles
pub struct PumpScanner {
    gateway: Arc<dyn ExchangeGateway>,
    quote_asset: String,
    settings: ScannerSettings,
}

impl PumpScanner {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        quote_asset: impl Into<String>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            gateway,
            quote_asset: quote_asset.into(),
            settings,
        }
    }

    fn is_tradeable(&self, symbol: &str) -> bool {
        // Dated delivery contracts carry an underscore (BTCUSDT_250627)
        symbol.ends_with(&self.quote_asset) && !symbol.contains('_')
    }
}

#[async_trait]
impl SignalSource for PumpScanner {
    async fn find_pumped_coins(&self, min_percent: f64) -> Result<Vec<PumpCandidate>> {
        let tickers = self.gateway.tickers_24h().await?;

        let mut candidates: Vec<PumpCandidate> = tickers
            .into_iter()
            .filter(|t| self.is_tradeable(&t.symbol))
            .filter(|t| t.price_change_percent >= min_percent)
            .filter(|t| t.quote_volume >= self.settings.min_quote_volume)
            .map(|t| PumpCandidate {
                symbol: t.symbol,
                pump_percent: t.price_change_percent,
                reference_price: t.last_price,
                quote_volume: t.quote_volume,
            })
            .collect();

        candidates.sort_by(|a, b| b.pump_percent.total_cmp(&a.pump_percent));

        tracing::debug!(
            "Pump scan: {} candidates >= {}%",
            candidates.len(),
            min_percent
        );
        Ok(candidates)
    }

    async fn check_trend(&self, symbol: &str) -> Result<TrendVerdict> {
        let klines = self
            .gateway
            .klines(
                symbol,
                &self.settings.trend_interval,
                self.settings.trend_lookback.max(self.settings.trend_ema_period + 1),
            )
            .await?;

        Ok(assess_trend(&closes(&klines), &self.settings))
    }
}

/// Decide whether a pump is still running from recent closes (oldest first).
///
/// Rejects when the last candle alone gained at least
/// `max_last_candle_gain_percent`, or when the last `trend_rising_bars` closes
/// are strictly rising and the latest sits above the EMA.
pub fn assess_trend(closes: &[f64], settings: &ScannerSettings) -> TrendVerdict {
    if closes.len() < 3 {
        return TrendVerdict::ok("not enough history to judge the trend");
    }

    let last = closes[closes.len() - 1];
    let previous = closes[closes.len() - 2];
    if previous > 0.0 {
        let gain = (last / previous - 1.0) * 100.0;
        if gain >= settings.max_last_candle_gain_percent {
            return TrendVerdict::reject(format!("still pumping: +{:.1}% last candle", gain));
        }
    }

    let bars = settings.trend_rising_bars.max(2).min(closes.len());
    let rising = closes[closes.len() - bars..]
        .windows(2)
        .all(|pair| pair[1] > pair[0]);
    let above_ema = calculate_ema(closes, settings.trend_ema_period)
        .map(|ema| last > ema)
        .unwrap_or(false);

    if rising && above_ema {
        TrendVerdict::reject(format!("uptrend continuing: {} higher closes above EMA", bars))
    } else {
        TrendVerdict::ok("momentum fading")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ticker24h;
    use crate::simulation::SimulatedExchange;

    fn settings() -> ScannerSettings {
        ScannerSettings {
            min_quote_volume: 1_000_000.0,
            trend_ema_period: 3,
            trend_rising_bars: 3,
            max_last_candle_gain_percent: 8.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_rising_closes_above_ema_rejected() {
        let closes = [1.0, 1.0, 1.0, 1.02, 1.05, 1.08];
        let verdict = assess_trend(&closes, &settings());
        assert!(!verdict.ok_to_short, "{}", verdict.reason);
    }

    #[test]
    fn test_big_last_candle_rejected() {
        let closes = [1.0, 1.2, 1.1, 1.25];
        let verdict = assess_trend(&closes, &settings());
        assert!(!verdict.ok_to_short);
        assert!(verdict.reason.contains("still pumping"));
    }

    #[test]
    fn test_stalling_pump_accepted() {
        let closes = [1.0, 1.3, 1.5, 1.45, 1.44, 1.46];
        let verdict = assess_trend(&closes, &settings());
        assert!(verdict.ok_to_short, "{}", verdict.reason);
    }

    #[tokio::test]
    async fn test_scan_filters_volume_and_sorts() {
        let exchange = Arc::new(SimulatedExchange::new(1000.0));
        exchange.set_tickers(vec![
            ticker("AUSDT", 35.0, 5_000_000.0),
            ticker("BUSDT", 60.0, 5_000_000.0),
            ticker("CUSDT", 80.0, 10_000.0),
            ticker("DUSDT", 12.0, 5_000_000.0),
            ticker("EUSDT_250627", 90.0, 5_000_000.0),
        ]);

        let scanner = PumpScanner::new(exchange, "USDT", settings());
        let candidates = scanner.find_pumped_coins(30.0).await.unwrap();

        let symbols: Vec<&str> = candidates.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BUSDT", "AUSDT"]);
    }

    fn ticker(symbol: &str, change: f64, volume: f64) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            last_price: 1.0,
            price_change_percent: change,
            quote_volume: volume,
        }
    }
}
