use chrono::Utc;
use shortbot::execution::{PositionStatus, PositionStore};
use shortbot::risk::RiskGate;
use shortbot::settings::{RiskSettings, StrategySettings};
use shortbot::simulation::{ScriptedSignals, SimulatedExchange};
use shortbot::strategy::StrategyEngine;
use std::collections::HashMap;
use std::sync::Arc;

const SYMBOL: &str = "PEPEUSDT";

fn strategy() -> StrategySettings {
    StrategySettings {
        ladder: vec![10.0, 15.0, 22.5],
        leverage: 10,
        min_pump_percent: 30.0,
        min_rsi: 70.0,
        rsi_period: 14,
        rsi_interval: "15m".to_string(),
        step_trigger_percent: 5.0,
        take_profit_percent: 1.5,
        half_close_min_steps: 2,
        exclusions: vec![],
        ..Default::default()
    }
}

/// Fifteen closes whose 14 changes give RSI(14) = 76
fn overbought_closes() -> Vec<f64> {
    let changes = [
        2.0, 2.0, -1.5, 2.0, 2.0, 2.0, -1.5, 2.0, 2.0, -1.5, 2.0, 1.0, -1.5, 2.0,
    ];
    let mut closes = vec![100.0];
    for change in changes {
        let last = closes[closes.len() - 1];
        closes.push(last + change);
    }
    closes
}

fn marks(price: f64) -> HashMap<String, f64> {
    HashMap::from([(SYMBOL.to_string(), price)])
}

#[tokio::test]
async fn test_pump_short_full_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();

    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.set_mark(SYMBOL, 1.35);
    exchange.set_closes(SYMBOL, "15m", &overbought_closes());

    let signals = Arc::new(ScriptedSignals::new());
    signals.add_pump(SYMBOL, 35.0, 1.35);

    let strategy = strategy();
    let risk = RiskSettings {
        max_positions: 3,
        ..Default::default()
    };
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), risk.max_positions);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals.clone(),
        None,
        RiskGate::new(&risk, &strategy),
    );

    // 1. Pump of 35% with RSI 76 opens a short at rung 0
    let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
    assert_eq!(opened, vec![SYMBOL.to_string()]);

    let position = store.get(SYMBOL).unwrap();
    assert_eq!(position.status(), PositionStatus::Active);
    assert_eq!(position.step_index(), 0);
    assert_eq!(position.total_margin(), 10.0);
    let first_average = position.average_entry_price();
    assert!((first_average - 1.35).abs() < 1e-12);
    assert!(exchange.position(SYMBOL).unwrap().is_short());

    // Nothing to do while price sits at entry
    let actions = engine.evaluate(&mut store, &marks(1.35), Utc::now()).await;
    assert!(actions.is_empty());

    // 2. Price runs another ~5% against us: step 1 at rung 15
    exchange.set_mark(SYMBOL, 1.42);
    let actions = engine.evaluate(&mut store, &marks(1.42), Utc::now()).await;
    assert_eq!(actions.steps_added, vec![SYMBOL.to_string()]);

    let position = store.get(SYMBOL).unwrap();
    assert_eq!(position.step_index(), 1);
    assert_eq!(position.total_margin(), 25.0);
    let average = position.average_entry_price();
    assert!(average > first_average && average < 1.42);

    let on_exchange = exchange.position(SYMBOL).unwrap();
    assert!((on_exchange.quantity() - position.total_quantity()).abs() < 1e-9);

    // 3. Back to the average: half the book is bought back
    let at_average = average * 0.999;
    exchange.set_mark(SYMBOL, at_average);
    let before = store.get(SYMBOL).unwrap().total_quantity();
    let actions = engine
        .evaluate(&mut store, &marks(at_average), Utc::now())
        .await;
    assert_eq!(actions.half_closed, vec![SYMBOL.to_string()]);

    let position = store.get(SYMBOL).unwrap();
    assert_eq!(position.status(), PositionStatus::HalfClosed);
    assert!((position.total_quantity() - before / 2.0).abs() <= 0.001);
    assert!((position.average_entry_price() - average).abs() < 1e-9);

    // Same price again does not halve a second time
    let actions = engine
        .evaluate(&mut store, &marks(at_average), Utc::now())
        .await;
    assert!(actions.is_empty());

    // 4. Take profit below the average closes everything
    let target = average * 0.98;
    exchange.set_mark(SYMBOL, target);
    let actions = engine.evaluate(&mut store, &marks(target), Utc::now()).await;
    assert_eq!(actions.closed, vec![SYMBOL.to_string()]);

    assert!(!store.contains(SYMBOL));
    assert!(exchange.position(SYMBOL).is_none());
    assert_eq!(exchange.open_order_count(SYMBOL), 0);
    assert!(store.stats().realized_pnl > 0.0);
    assert_eq!(store.stats().wins, 2);
    assert!(engine.risk().daily_realized() > 0.0);
}

#[tokio::test]
async fn test_low_rsi_pump_is_skipped() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.set_mark(SYMBOL, 1.35);
    // Steady decline: RSI 0
    let closes: Vec<f64> = (0..20).map(|i| 2.0 - i as f64 * 0.01).collect();
    exchange.set_closes(SYMBOL, "15m", &closes);

    let signals = Arc::new(ScriptedSignals::new());
    signals.add_pump(SYMBOL, 35.0, 1.35);

    let strategy = strategy();
    let risk = RiskSettings::default();
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), 3);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals,
        None,
        RiskGate::new(&risk, &strategy),
    );

    let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
    assert!(opened.is_empty());
    assert!(store.get(SYMBOL).is_none());
    assert!(exchange.order_calls().is_empty());
}

#[tokio::test]
async fn test_failed_entry_leaves_no_position() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.set_mark(SYMBOL, 1.35);
    exchange.set_mark("WIFUSDT", 2.0);
    exchange.fail_entries_for(SYMBOL);

    let signals = Arc::new(ScriptedSignals::new());
    signals.add_pump(SYMBOL, 50.0, 1.35);
    signals.add_pump("WIFUSDT", 40.0, 2.0);

    let strategy = strategy();
    let risk = RiskSettings::default();
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), 3);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals,
        None,
        RiskGate::new(&risk, &strategy),
    );

    // RSI history missing for both: the check is skipped
    let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
    assert_eq!(opened, vec!["WIFUSDT".to_string()]);
    assert!(!store.contains(SYMBOL));
    assert!(exchange.position(SYMBOL).is_none());
}

#[tokio::test]
async fn test_emergency_close_blacklists_after_repeats() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    let signals = Arc::new(ScriptedSignals::new());

    let strategy = strategy();
    let risk = RiskSettings::default();
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), 3);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals.clone(),
        None,
        RiskGate::new(&risk, &strategy),
    );
    signals.add_pump(SYMBOL, 35.0, 1.0);

    for _ in 0..2 {
        exchange.set_mark(SYMBOL, 1.0);
        let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
        assert_eq!(opened.len(), 1);

        // +50% is past the 40% adverse excursion limit
        exchange.set_mark(SYMBOL, 1.5);
        let actions = engine.evaluate(&mut store, &marks(1.5), Utc::now()).await;
        assert_eq!(actions.emergency_closed, vec![SYMBOL.to_string()]);
        assert!(!store.contains(SYMBOL));
    }

    exchange.set_mark(SYMBOL, 1.0);
    let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
    assert!(opened.is_empty());
    assert!(engine.risk().check_symbol(SYMBOL, Utc::now()).is_err());
}

#[tokio::test]
async fn test_favourable_gap_exit_does_not_blacklist() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    let signals = Arc::new(ScriptedSignals::new());
    signals.add_pump(SYMBOL, 35.0, 1.0);

    let strategy = strategy();
    let risk = RiskSettings::default();
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), 3);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals,
        None,
        RiskGate::new(&risk, &strategy),
    );

    for _ in 0..2 {
        exchange.set_mark(SYMBOL, 1.0);
        let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
        assert_eq!(opened, vec![SYMBOL.to_string()]);

        // 45% below the average: past the excursion limit, but in our favour
        exchange.set_mark(SYMBOL, 0.55);
        let actions = engine.evaluate(&mut store, &marks(0.55), Utc::now()).await;
        assert_eq!(actions.closed, vec![SYMBOL.to_string()]);
        assert!(actions.emergency_closed.is_empty());
    }

    assert!(engine.risk().check_symbol(SYMBOL, Utc::now()).is_ok());
    assert!(engine.risk().daily_realized() > 0.0);
    assert_eq!(store.stats().wins, 2);
}

#[tokio::test]
async fn test_failed_step_does_not_stop_other_symbols() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.set_mark(SYMBOL, 1.0);
    exchange.set_mark("WIFUSDT", 2.0);

    let signals = Arc::new(ScriptedSignals::new());
    signals.add_pump(SYMBOL, 50.0, 1.0);
    signals.add_pump("WIFUSDT", 40.0, 2.0);

    let strategy = strategy();
    let risk = RiskSettings::default();
    let mut store = PositionStore::new(exchange.clone(), strategy.clone(), 3);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        signals,
        None,
        RiskGate::new(&risk, &strategy),
    );

    let opened = engine.scan_for_entries(&mut store, Utc::now()).await.unwrap();
    assert_eq!(opened.len(), 2);

    // PEPEUSDT's next SELL is rejected for margin, WIFUSDT's goes through
    exchange.fail_entries_for(SYMBOL);
    exchange.set_mark(SYMBOL, 1.06);
    exchange.set_mark("WIFUSDT", 2.12);
    let marks = HashMap::from([
        (SYMBOL.to_string(), 1.06),
        ("WIFUSDT".to_string(), 2.12),
    ]);

    let actions = engine.evaluate(&mut store, &marks, Utc::now()).await;

    assert_eq!(actions.failed.len(), 1);
    assert_eq!(actions.failed[0].0, SYMBOL);
    assert_eq!(actions.steps_added, vec!["WIFUSDT".to_string()]);
    assert_eq!(store.get(SYMBOL).unwrap().step_index(), 0);
    assert_eq!(store.get("WIFUSDT").unwrap().step_index(), 1);
}
