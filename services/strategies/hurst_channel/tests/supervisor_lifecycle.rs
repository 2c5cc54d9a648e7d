//! Supervisor lifecycle against the in-memory collaborators

use config::{DispatcherConfig, InstanceConfig};
use hurst_channel::{
    Broker, InMemoryMarketData, InMemoryPersistence, InstanceDeps, InstanceStatus, PaperBroker,
    Persistence, SignalQuery, StrategyError, Supervisor,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use types::{
    Candle, CandleInterval, ExitReason, ManualClock, PositionStatus, SignalCategory, SignalKind,
    Tick, HOUR_MS, MINUTE_MS,
};

const T0: u64 = 1_699_992_000_000;

struct Harness {
    market_data: Arc<InMemoryMarketData>,
    broker: Arc<PaperBroker>,
    persistence: Arc<InMemoryPersistence>,
    supervisor: Supervisor,
}

impl Harness {
    fn new() -> Self {
        Self::with_persistence(Arc::new(InMemoryPersistence::new()), Arc::new(market_data()))
    }

    fn with_persistence(persistence: Arc<InMemoryPersistence>, market_data: Arc<InMemoryMarketData>) -> Self {
        let broker = Arc::new(PaperBroker::new().with_balance("USDT", dec!(10000)));
        let supervisor = Supervisor::new(InstanceDeps {
            market_data: market_data.clone(),
            broker: broker.clone(),
            persistence: persistence.clone(),
            clock: Arc::new(ManualClock::new(T0)),
            dispatcher: DispatcherConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                ..DispatcherConfig::default()
            },
        });
        Self {
            market_data,
            broker,
            persistence,
            supervisor,
        }
    }
}

fn market_data() -> InMemoryMarketData {
    let market_data = InMemoryMarketData::new();
    let a = (625.0f64 / 24.0).sqrt();
    let mut closes: Vec<f64> = (0..24)
        .map(|i| if i % 2 == 0 { 110.0 + a } else { 110.0 - a })
        .collect();
    closes.push(110.0);
    let step = CandleInterval::FOUR_HOURS.as_ms();
    let start = T0 - step * closes.len() as u64;
    let channel = closes
        .iter()
        .enumerate()
        .map(|(i, close)| Candle::flat(CandleInterval::FOUR_HOURS, start + i as u64 * step, *close))
        .collect();
    market_data.insert_candles("BTCUSDT", CandleInterval::FOUR_HOURS, channel);

    let ema = (0..30)
        .map(|i| Candle::flat(CandleInterval::ONE_HOUR, T0 - (30 - i) * HOUR_MS, 110.0))
        .collect();
    market_data.insert_candles("BTCUSDT", CandleInterval::ONE_HOUR, ema);
    market_data
}

fn config(test_mode: bool) -> InstanceConfig {
    let mut config = InstanceConfig::new("BTCUSDT", dec!(1000));
    config.hurst.interval = CandleInterval::FOUR_HOURS;
    config.test_mode = test_mode;
    config
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_entry_manual_exit_and_archive() {
    let h = Harness::new();
    let id = assert_ok!(h.supervisor.create(config(true)).await);
    assert_eq!(h.supervisor.snapshot(id).unwrap().status, InstanceStatus::Created);

    assert_ok!(h.supervisor.start(id).await);
    assert_eq!(h.supervisor.snapshot(id).unwrap().status, InstanceStatus::Running);

    let touch = Tick::new("BTCUSDT", 100.0, T0 + MINUTE_MS).with_range(100.0, 99.8);
    assert_eq!(h.market_data.publish(touch).await, 1);
    eventually("entry fill", || {
        let snapshot = h.supervisor.snapshot(id).unwrap();
        snapshot.metrics.orders_executed == 1 && snapshot.entries_in_flight == 0
    })
    .await;

    let snapshot = h.supervisor.snapshot(id).unwrap();
    assert_eq!(snapshot.position_status, PositionStatus::Active);
    assert_eq!(snapshot.ledger.locked, dec!(100));
    // Test mode never reaches the broker
    assert_eq!(h.broker.call_count(), 0);

    let exit = assert_ok!(h.supervisor.manual_exit(id).await);
    assert_eq!(exit.kind, SignalKind::Exit(ExitReason::Manual));
    assert_eq!(exit.price, 100.0);
    eventually("archive", || h.persistence.archived().len() == 1).await;
    eventually("ledger settle", || {
        h.supervisor.snapshot(id).unwrap().position.is_none()
    })
    .await;

    let archived = &h.persistence.archived()[0];
    assert_eq!(archived.details.reason, ExitReason::Manual);
    assert_eq!(archived.details.profit, dec!(0));

    let exits = h
        .supervisor
        .signals(&SignalQuery::for_instance(id).category(SignalCategory::Exit))
        .await
        .unwrap();
    assert_eq!(exits.len(), 1);

    assert_ok!(h.supervisor.stop(id).await);
    assert_eq!(h.supervisor.snapshot(id).unwrap().status, InstanceStatus::Stopped);
    let records = h.persistence.load_instances().await.unwrap();
    assert!(!records[0].running);

    assert_ok!(h.supervisor.delete(id).await);
    assert!(h.supervisor.list().is_empty());
}

#[tokio::test]
async fn test_manual_exit_without_position_is_refused() {
    let h = Harness::new();
    let id = h.supervisor.create(config(true)).await.unwrap();
    assert!(matches!(
        h.supervisor.manual_exit(id).await,
        Err(StrategyError::InvalidInstanceState { .. })
    ));

    h.supervisor.start(id).await.unwrap();
    assert!(h.supervisor.manual_exit(id).await.is_err());
    h.supervisor.stop(id).await.unwrap();
}

#[tokio::test]
async fn test_delete_refused_with_open_position() {
    let h = Harness::new();
    let id = h.supervisor.create(config(true)).await.unwrap();
    h.supervisor.start(id).await.unwrap();

    let touch = Tick::new("BTCUSDT", 99.0, T0 + MINUTE_MS);
    h.market_data.publish(touch).await;
    eventually("open position persisted", || {
        h.supervisor.snapshot(id).unwrap().metrics.orders_executed == 1
    })
    .await;

    assert!(h.supervisor.delete(id).await.is_err());
    h.supervisor.stop(id).await.unwrap();
    assert!(matches!(
        h.supervisor.delete(id).await,
        Err(StrategyError::InvalidInstanceState { .. })
    ));
    assert!(h.persistence.load_open_position(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_fails_without_history() {
    let h = Harness::with_persistence(
        Arc::new(InMemoryPersistence::new()),
        Arc::new(InMemoryMarketData::new()),
    );
    let id = h.supervisor.create(config(true)).await.unwrap();
    let err = h.supervisor.start(id).await.unwrap_err();
    assert!(matches!(err, StrategyError::MarketData(_)));

    let snapshot = h.supervisor.snapshot(id).unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Failed);
    assert!(snapshot.last_error.is_some());
}

#[tokio::test]
async fn test_live_entry_goes_through_broker() {
    let h = Harness::new();
    h.broker.set_price("BTCUSDT", 99.0);
    let id = h.supervisor.create(config(false)).await.unwrap();
    h.supervisor.start(id).await.unwrap();

    h.market_data
        .publish(Tick::new("BTCUSDT", 99.0, T0 + MINUTE_MS))
        .await;
    eventually("broker fill", || h.broker.fill_count() == 1).await;
    eventually("entry confirmed", || {
        h.supervisor.snapshot(id).unwrap().metrics.orders_executed == 1
    })
    .await;
    let balance = h.broker.get_balance("USDT").await.unwrap();
    assert_eq!(balance.available, dec!(9900));
    h.supervisor.stop(id).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_and_restore_resumes_running_instances() {
    let persistence = Arc::new(InMemoryPersistence::new());
    let first = Harness::with_persistence(persistence.clone(), Arc::new(market_data()));
    let running = first.supervisor.create(config(true)).await.unwrap();
    let idle = first.supervisor.create(config(true)).await.unwrap();
    first.supervisor.start(running).await.unwrap();

    first
        .market_data
        .publish(Tick::new("BTCUSDT", 99.0, T0 + MINUTE_MS))
        .await;
    eventually("entry", || {
        first.supervisor.snapshot(running).unwrap().metrics.orders_executed == 1
    })
    .await;
    first.supervisor.shutdown().await;

    let second = Harness::with_persistence(persistence, Arc::new(market_data()));
    assert_eq!(second.supervisor.restore().await.unwrap(), 1);

    let restored = second.supervisor.snapshot(running).unwrap();
    assert_eq!(restored.status, InstanceStatus::Running);
    assert_eq!(restored.position_status, PositionStatus::Active);
    assert_eq!(restored.ledger.locked, dec!(100));
    assert_eq!(restored.last_entry_time, Some(T0 + MINUTE_MS));
    assert_eq!(
        second.supervisor.snapshot(idle).unwrap().status,
        InstanceStatus::Created
    );
    assert_eq!(second.supervisor.list().len(), 2);
    second.supervisor.shutdown().await;
}
