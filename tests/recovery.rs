use chrono::Utc;
use shortbot::execution::{PositionStatus, PositionStore, ProtectiveKind};
use shortbot::models::{OrderKind, PumpCandidate};
use shortbot::risk::RiskGate;
use shortbot::settings::{RiskSettings, StrategySettings};
use shortbot::simulation::{ScriptedSignals, SimulatedExchange};
use shortbot::strategy::StrategyEngine;
use std::collections::HashMap;
use std::sync::Arc;

fn strategy() -> StrategySettings {
    StrategySettings {
        ladder: vec![10.0, 15.0, 22.5],
        leverage: 10,
        ..Default::default()
    }
}

fn store(exchange: &Arc<SimulatedExchange>) -> PositionStore {
    PositionStore::new(exchange.clone(), strategy(), 3)
}

#[tokio::test]
async fn test_recover_reproduces_exchange_book_exactly() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    // margin 10 -> step 0
    exchange.seed_position("PEPEUSDT", -74.074, 1.35, 10);
    // margin 25 -> step 1, corroborated by a working stop
    exchange.seed_position("WIFUSDT", -125.0, 2.0, 10);
    exchange.seed_order("WIFUSDT", OrderKind::StopMarket, 125.0, 2.8);
    // margin 47.5 -> step 2
    exchange.seed_position("BONKUSDT", -1_583_333.0, 0.0003, 10);
    exchange.seed_order("BONKUSDT", OrderKind::StopMarket, 1_583_333.0, 0.00042);

    let mut store = store(&exchange);
    let report = store.recover().await.unwrap();

    assert_eq!(report.recovered.len(), 3);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    let snapshot = store.snapshot(&HashMap::new(), 1000.0, false, 0);
    for symbol in ["PEPEUSDT", "WIFUSDT", "BONKUSDT"] {
        let on_exchange = exchange.position(symbol).unwrap();
        let view = &snapshot.positions[symbol];
        assert_eq!(view.total_quantity, on_exchange.quantity(), "{}", symbol);
        assert_eq!(view.average_entry, on_exchange.entry_price, "{}", symbol);
        assert_eq!(view.status, PositionStatus::Active);
        assert!(view.recovered);
    }

    assert_eq!(snapshot.positions["PEPEUSDT"].step, 0);
    assert_eq!(snapshot.positions["WIFUSDT"].step, 1);
    assert_eq!(snapshot.positions["BONKUSDT"].step, 2);
    assert_eq!(snapshot.positions["WIFUSDT"].total_margin, 25.0);

    let wif = store.get("WIFUSDT").unwrap();
    assert!(wif.protective_orders().get(ProtectiveKind::StopLoss).is_some());
}

#[tokio::test]
async fn test_recover_with_empty_account() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    let mut store = store(&exchange);

    let report = store.recover().await.unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(store.open_count(), 0);
}

#[tokio::test]
async fn test_uncorroborated_step_collapses_to_zero() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.seed_position("WIFUSDT", -125.0, 2.0, 10);

    let mut store = store(&exchange);
    let report = store.recover().await.unwrap();

    assert_eq!(report.recovered, vec!["WIFUSDT".to_string()]);
    assert_eq!(report.warnings.len(), 1);
    let position = store.get("WIFUSDT").unwrap();
    assert_eq!(position.step_index(), 0);
    assert_eq!(position.total_quantity(), 125.0);
    assert_eq!(position.average_entry_price(), 2.0);
}

#[tokio::test]
async fn test_long_positions_are_not_adopted() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.seed_position("SOLUSDT", 3.0, 150.0, 10);

    let mut store = store(&exchange);
    let report = store.recover().await.unwrap();

    assert!(report.recovered.is_empty());
    assert_eq!(report.warnings.len(), 1);
    assert!(!store.contains("SOLUSDT"));
}

#[tokio::test]
async fn test_recover_fails_when_exchange_unreachable() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.set_unreachable(true);

    let mut store = store(&exchange);
    assert!(store.recover().await.is_err());
}

#[tokio::test]
async fn test_resync_removes_externally_closed_position() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.seed_position("PEPEUSDT", -74.074, 1.35, 10);
    exchange.seed_position("WIFUSDT", -50.0, 2.0, 10);

    let mut store = store(&exchange);
    store.recover().await.unwrap();

    exchange.close_externally("PEPEUSDT");
    let report = store.resync().await.unwrap();

    assert_eq!(report.removed, vec!["PEPEUSDT".to_string()]);
    assert!(!store.contains("PEPEUSDT"));
    assert!(store.contains("WIFUSDT"));
    assert_eq!(store.stats().trades(), 0);
    assert!(report.stopped_out.is_empty());
}

#[tokio::test]
async fn test_resync_adopts_and_reanchors() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    exchange.seed_position("PEPEUSDT", -74.074, 1.35, 10);

    let mut store = store(&exchange);
    store.recover().await.unwrap();

    // Someone adds to the short by hand and opens another one
    exchange.seed_position("PEPEUSDT", -100.0, 1.4, 10);
    exchange.seed_position("WIFUSDT", -50.0, 2.0, 10);

    let report = store.resync().await.unwrap();
    assert_eq!(report.refreshed, vec!["PEPEUSDT".to_string()]);
    assert_eq!(report.adopted, vec!["WIFUSDT".to_string()]);

    let pepe = store.get("PEPEUSDT").unwrap();
    assert_eq!(pepe.total_quantity(), 100.0);
    assert_eq!(pepe.average_entry_price(), 1.4);

    // Nothing changed since: the next pass is quiet
    let again = store.resync().await.unwrap();
    assert!(again.is_quiet(), "{:?}", again);
}

#[tokio::test]
async fn test_resync_books_exchange_stop_out() {
    let exchange = Arc::new(SimulatedExchange::new(1000.0));
    let strategy = strategy();
    let mut store = store(&exchange);
    let mut engine = StrategyEngine::new(
        strategy.clone(),
        exchange.clone(),
        Arc::new(ScriptedSignals::new()),
        None,
        RiskGate::new(&RiskSettings::default(), &strategy),
    );
    let candidate = PumpCandidate {
        symbol: "PEPEUSDT".to_string(),
        pump_percent: 40.0,
        reference_price: 1.0,
        quote_volume: 10_000_000.0,
    };

    for round in 1..=2u32 {
        exchange.set_mark("PEPEUSDT", 1.0);
        store.open_position(&candidate).await.unwrap();
        let position = store.get("PEPEUSDT").unwrap();
        let quantity = position.total_quantity();
        let stop = position
            .protective_orders()
            .get(ProtectiveKind::StopLoss)
            .and_then(|o| o.trigger_price)
            .unwrap();

        // The exchange stop fires: position and its orders are gone
        exchange.close_externally("PEPEUSDT");
        let report = store.resync().await.unwrap();

        assert_eq!(report.removed, vec!["PEPEUSDT".to_string()]);
        assert_eq!(report.stopped_out.len(), 1);
        let (symbol, pnl) = report.stopped_out[0].clone();
        assert_eq!(symbol, "PEPEUSDT");
        assert!((pnl - (1.0 - stop) * quantity).abs() < 1e-9);
        assert!(pnl < 0.0);
        assert_eq!(store.stats().losses, round);

        engine.record_stop_out(&symbol, pnl, Utc::now());
    }

    assert!(engine.risk().daily_realized() < 0.0);
    assert!(engine.risk().check_symbol("PEPEUSDT", Utc::now()).is_err());
}
