use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use uuid::Uuid;

use tradepilot::adapters::{ChannelSignalSource, StaticPriceFeed};
use tradepilot::config::AppConfig;
use tradepilot::coordination::{GracefulShutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal};
use tradepilot::domain::{
    BrokerOrderStatus, CancelAck, ExitReason, Instrument, OptionContract, OrderAck, OrderRequest,
    OrderSide, OrderType, PositionStatus, PutCall, Signal, TransitionReason,
};
use tradepilot::error::{BrokerError, GateRejection, PilotError, RiskRejection};
use tradepilot::exchange::{BrokerClient, BrokerKind, PriceFeed};
use tradepilot::persistence::{JsonFileStore, LedgerStore};
use tradepilot::strategy::{Admission, ExecutionEngine, ExitCheck, PositionLedger, SignalOutcome};
use tradepilot::supervisor::{AlertLevel, AlertManager};

#[derive(Clone, Copy)]
enum Behaviour {
    /// Every order fills immediately at the limit, or at the market price
    Fill,
    /// Every order is refused
    Reject,
    /// Orders stay working forever and cancels fail
    Hang,
}

struct FakeBroker {
    behaviour: Behaviour,
    market: Mutex<Decimal>,
    placed: Mutex<Vec<OrderRequest>>,
}

impl FakeBroker {
    fn new(behaviour: Behaviour, market: Decimal) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            market: Mutex::new(market),
            placed: Mutex::new(Vec::new()),
        })
    }

    fn set_market(&self, price: Decimal) {
        *self.market.lock().unwrap() = price;
    }

    fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BrokerError> {
        self.placed.lock().unwrap().push(request.clone());
        let order_id = format!("fake-{}", request.client_request_id);

        match self.behaviour {
            Behaviour::Fill => {
                let market = *self.market.lock().unwrap();
                Ok(OrderAck {
                    order_id,
                    status: BrokerOrderStatus::Filled,
                    fill_price: Some(request.limit_price.unwrap_or(market)),
                    filled_quantity: request.quantity,
                    detail: None,
                })
            }
            Behaviour::Reject => Err(BrokerError::Rejected("insufficient buying power".to_string())),
            Behaviour::Hang => Ok(OrderAck {
                order_id,
                status: BrokerOrderStatus::Working,
                fill_price: None,
                filled_quantity: 0,
                detail: None,
            }),
        }
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
        Ok(OrderAck {
            order_id: order_id.to_string(),
            status: BrokerOrderStatus::Working,
            fill_price: None,
            filled_quantity: 0,
            detail: None,
        })
    }

    async fn cancel_order(
        &self,
        _client_request_id: &str,
        _order_id: Option<&str>,
    ) -> Result<CancelAck, BrokerError> {
        Err(BrokerError::Transport("connection reset".to_string()))
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default_config(true);
    config.execution.order_type = OrderType::Market;
    config.execution.order_timeout_ms = 200;
    config.execution.poll_interval_ms = 10;
    config.execution.cancel_timeout_ms = 50;
    config.execution.retry_base_delay_ms = 5;
    config.exit.use_market_orders = true;
    config.schedule.check_signals_interval_ms = 10;
    config.schedule.exit_poll_interval_ms = 10;
    config
}

fn option_signal(strike: Decimal, strength: Decimal, premium: Decimal) -> Signal {
    Signal {
        id: Uuid::new_v4(),
        symbol: "AAPL".to_string(),
        instrument: Instrument::Option(OptionContract {
            strike,
            expiry: Utc::now().date_naive() + Duration::days(30),
            put_call: PutCall::Call,
            contract_symbol: None,
            delta: Some(dec!(0.5)),
            volume: Some(500),
            open_interest: Some(200),
        }),
        action: OrderSide::Buy,
        quantity: None,
        strength,
        source: "benzinga_options_flow".to_string(),
        timestamp: Utc::now(),
        rationale: "Unusual call volume".to_string(),
        reference_price: Some(premium),
        market_volume: None,
    }
}

fn stock_signal(symbol: &str, price: Decimal) -> Signal {
    Signal {
        id: Uuid::new_v4(),
        symbol: symbol.to_string(),
        instrument: Instrument::Equity,
        action: OrderSide::Buy,
        quantity: None,
        strength: dec!(0.8),
        source: "custom_scanner".to_string(),
        timestamp: Utc::now(),
        rationale: String::new(),
        reference_price: Some(price),
        market_volume: Some(2_000_000),
    }
}

struct Harness {
    engine: Arc<ExecutionEngine>,
    broker: Arc<FakeBroker>,
    quotes: Arc<StaticPriceFeed>,
    alerts: Arc<AlertManager>,
}

fn harness(config: AppConfig, broker: Arc<FakeBroker>, ledger: PositionLedger) -> Harness {
    let quotes = Arc::new(StaticPriceFeed::new());
    let alerts = Arc::new(AlertManager::new(config.alerts.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        config,
        Arc::new(ledger),
        Arc::clone(&broker) as Arc<dyn BrokerClient>,
        Arc::clone(&quotes) as Arc<dyn PriceFeed>,
        Arc::clone(&alerts),
    ));
    Harness {
        engine,
        broker,
        quotes,
        alerts,
    }
}

fn default_harness(behaviour: Behaviour) -> Harness {
    let config = test_config();
    let ledger = PositionLedger::new(config.account.balance);
    harness(config, FakeBroker::new(behaviour, dec!(100)), ledger)
}

#[tokio::test]
async fn accepted_option_signal_is_sized_and_submitted_once() {
    let h = default_harness(Behaviour::Fill);
    h.broker.set_market(dec!(3.50));
    let signal = option_signal(dec!(200), dec!(0.8), dec!(3.50));

    let outcome = h.engine.process_signal(&signal).await.unwrap();

    let SignalOutcome::Opened(position) = outcome else {
        panic!("expected an opened position, got {:?}", outcome);
    };
    // min(5% of 100k, 10k) x 0.8
    assert_eq!(position.reserved_amount, dec!(4000));
    // 4000 / (3.50 x 100)
    assert_eq!(position.quantity, 11);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.entry_price, dec!(3.50));

    let placed = h.broker.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].symbol, "AAPL");
    assert_eq!(placed[0].side, OrderSide::Buy);
    assert_eq!(placed[0].client_request_id, signal.entry_request_id());
    assert!(placed[0].option_leg.is_some());

    let risk = h.engine.ledger().risk_state().await;
    assert_eq!(risk.risk_used_today, dec!(4000));
    assert_eq!(risk.open_position_count, 1);
}

#[tokio::test]
async fn risk_rejection_submits_nothing_and_leaves_ledger_unchanged() {
    let mut config = test_config();
    config.risk.max_open_positions = 1;
    let ledger = PositionLedger::new(config.account.balance);
    let h = harness(config, FakeBroker::new(Behaviour::Fill, dec!(100)), ledger);

    let first = h.engine.process_signal(&stock_signal("MSFT", dec!(100))).await.unwrap();
    assert!(matches!(first, SignalOutcome::Opened(_)));
    let before = h.engine.ledger().risk_state().await;

    let outcome = h
        .engine
        .process_signal(&option_signal(dec!(200), dec!(0.8), dec!(3.50)))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SignalOutcome::RiskLimited(RiskRejection::MaxOpenPositions { open: 1, max: 1 })
    );
    assert_eq!(h.broker.placed().len(), 1);
    assert_eq!(h.engine.ledger().risk_state().await, before);
    assert_eq!(h.engine.ledger().list(None).await.len(), 1);
}

#[tokio::test]
async fn take_profit_exit_closes_with_realized_pnl() {
    let h = default_harness(Behaviour::Fill);
    let outcome = h.engine.process_signal(&stock_signal("AAPL", dec!(100))).await.unwrap();
    let SignalOutcome::Opened(position) = outcome else {
        panic!("expected an opened position, got {:?}", outcome);
    };
    assert_eq!(position.quantity, 40);

    h.quotes.set_price("AAPL", dec!(150)).await;
    h.broker.set_market(dec!(150));

    let check = h.engine.exit_monitor().check_position(position.id).await.unwrap();
    let ExitCheck::Closed(closed) = check else {
        panic!("expected the position to close, got {:?}", check);
    };
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
    assert_eq!(closed.exit_price, Some(dec!(150)));
    assert_eq!(closed.realized_pnl, Some(dec!(2000)));

    let placed = h.broker.placed();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[1].side, OrderSide::Sell);
    assert_eq!(placed[1].quantity, 40);

    let risk = h.engine.ledger().risk_state().await;
    assert_eq!(risk.open_position_count, 0);
    assert_eq!(risk.account_balance, dec!(102000));
}

#[tokio::test]
async fn quiet_market_holds_the_position() {
    let h = default_harness(Behaviour::Fill);
    let SignalOutcome::Opened(position) =
        h.engine.process_signal(&stock_signal("NVDA", dec!(100))).await.unwrap()
    else {
        panic!("expected an opened position");
    };

    h.quotes.set_price("NVDA", dec!(104)).await;
    let check = h.engine.exit_monitor().check_position(position.id).await.unwrap();
    assert_eq!(check, ExitCheck::Hold);
    assert_eq!(h.engine.run_exit_pass().await, 0);
    assert_eq!(h.broker.placed().len(), 1);
}

#[tokio::test]
async fn entry_timeout_with_failed_cancel_requires_reconciliation() {
    let h = default_harness(Behaviour::Hang);
    let mut alerts = h.alerts.subscribe();

    let outcome = h.engine.process_signal(&stock_signal("TSLA", dec!(250))).await.unwrap();

    let SignalOutcome::Unreconciled(position) = outcome else {
        panic!("expected reconciliation, got {:?}", outcome);
    };
    assert_eq!(position.status, PositionStatus::Failed);
    assert!(matches!(
        position.last_reason,
        Some(TransitionReason::ReconciliationRequired(_))
    ));

    let mut surfaced = false;
    while let Ok(alert) = alerts.try_recv() {
        if alert.level == AlertLevel::Critical && alert.title == "Reconciliation Required" {
            surfaced = true;
        }
    }
    assert!(surfaced, "reconciliation must reach the alert sink");

    // Broker state unknown, so the reserved risk stays charged
    let risk = h.engine.ledger().risk_state().await;
    assert_eq!(risk.open_position_count, 0);
    assert_eq!(risk.risk_used_today, dec!(4000));
}

#[tokio::test]
async fn broker_rejection_fails_entry_and_refunds_risk() {
    let h = default_harness(Behaviour::Reject);

    let outcome = h.engine.process_signal(&stock_signal("AMD", dec!(150))).await.unwrap();

    let SignalOutcome::Rejected(position) = outcome else {
        panic!("expected rejection, got {:?}", outcome);
    };
    assert_eq!(position.status, PositionStatus::Failed);
    assert_eq!(h.broker.placed().len(), 1);

    let risk = h.engine.ledger().risk_state().await;
    assert_eq!(risk.open_position_count, 0);
    assert_eq!(risk.risk_used_today, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_signals_never_exceed_max_open_positions() {
    let h = default_harness(Behaviour::Fill);
    h.broker.set_market(dec!(3.50));

    let mut tasks = JoinSet::new();
    for i in 0..20u32 {
        let engine = Arc::clone(&h.engine);
        let signal = option_signal(Decimal::from(100 + i), dec!(0.1), dec!(3.50));
        tasks.spawn(async move { engine.process_signal(&signal).await.unwrap() });
    }

    let mut opened = 0;
    let mut limited = 0;
    while let Some(outcome) = tasks.join_next().await {
        match outcome.unwrap() {
            SignalOutcome::Opened(_) => opened += 1,
            SignalOutcome::RiskLimited(_) => limited += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(opened, 5);
    assert_eq!(limited, 15);
    assert_eq!(h.broker.placed().len(), 5);

    let risk = h.engine.ledger().risk_state().await;
    assert_eq!(risk.open_position_count, 5);
    assert!(risk.risk_used_today <= dec!(5000));
}

#[tokio::test]
async fn redelivered_signal_opens_at_most_one_position() {
    let h = default_harness(Behaviour::Fill);
    let signal = stock_signal("META", dec!(300));

    let first = h.engine.process_signal(&signal).await.unwrap();
    assert!(matches!(first, SignalOutcome::Opened(_)));

    let second = h.engine.process_signal(&signal).await.unwrap();
    assert_eq!(
        second,
        SignalOutcome::Gated(GateRejection::DuplicateSignal {
            signal_id: signal.id
        })
    );

    // A fresh signal for the same instrument is a duplicate position
    let third = h.engine.process_signal(&stock_signal("META", dec!(301))).await.unwrap();
    assert!(matches!(
        third,
        SignalOutcome::Gated(GateRejection::DuplicatePosition { .. })
    ));

    assert_eq!(h.broker.placed().len(), 1);
    assert_eq!(h.engine.ledger().list(None).await.len(), 1);
}

#[tokio::test]
async fn unwatched_symbol_is_gated() {
    let h = default_harness(Behaviour::Fill);

    let outcome = h.engine.process_signal(&stock_signal("GME", dec!(20))).await.unwrap();

    assert!(matches!(
        outcome,
        SignalOutcome::Gated(GateRejection::NotInWatchlist { .. })
    ));
    assert!(h.broker.placed().is_empty());
}

#[tokio::test]
async fn restart_fails_in_flight_positions_and_resumes_open_ones() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    {
        let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
        let ledger = PositionLedger::new(config.account.balance).with_store(store);
        let h = harness(config.clone(), FakeBroker::new(Behaviour::Fill, dec!(100)), ledger);

        let opened = h.engine.process_signal(&stock_signal("AAPL", dec!(100))).await.unwrap();
        assert!(matches!(opened, SignalOutcome::Opened(_)));

        // Reserved but the process dies before the broker answers
        let watchlist = config.watchlist_set();
        let mut pending = stock_signal("MSFT", dec!(400));
        pending.strength = dec!(0.2);
        h.engine
            .ledger()
            .reserve(
                &pending,
                Admission {
                    watchlist: &watchlist,
                    entry: &config.entry,
                    risk: &config.risk,
                    unit_price: dec!(400),
                    max_hold: config.exit.max_hold(),
                    now: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
    let ledger = PositionLedger::new(config.account.balance).with_store(store);
    let h = harness(config, FakeBroker::new(Behaviour::Fill, dec!(100)), ledger);
    let mut alerts = h.alerts.subscribe();

    let open = tokio_test::assert_ok!(h.engine.restore().await);

    assert_eq!(open, 1);
    let failed = h.engine.ledger().list(Some(PositionStatus::Failed)).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].symbol, "MSFT");
    assert_eq!(h.engine.ledger().open_position_count().await, 1);

    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.level, AlertLevel::Critical);
    assert_eq!(alert.title, "Reconciliation Required");
}

#[tokio::test]
async fn run_loop_processes_signals_and_flushes_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let store = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
    let ledger = PositionLedger::new(config.account.balance)
        .with_store(Arc::clone(&store) as Arc<dyn LedgerStore>);
    let h = harness(config, FakeBroker::new(Behaviour::Fill, dec!(100)), ledger);

    let (tx, source) = ChannelSignalSource::new(16);
    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig {
        order_drain_timeout_secs: 5,
        flush_timeout_secs: 5,
    }));
    let running = tokio::spawn(Arc::clone(&h.engine).run(source, Arc::clone(&shutdown)));

    tx.send(stock_signal("AMZN", dec!(180))).await.unwrap();

    let ledger = Arc::clone(h.engine.ledger());
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while ledger.list(Some(PositionStatus::Open)).await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("signal was not processed in time");

    shutdown.request_shutdown(ShutdownSignal::Graceful);
    let result = running.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);

    let snapshot = store.load_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.positions[0].status, PositionStatus::Open);
    assert_eq!(snapshot.risk.open_position_count, 1);
}

#[tokio::test]
async fn unreadable_ledger_blocks_startup_and_is_left_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let damaged = r#"{"version": 41, "positions": [ {"truncated": "#;
    std::fs::write(&ledger_path, damaged).unwrap();

    let config = test_config();
    let store: Arc<dyn LedgerStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
    let ledger = PositionLedger::new(config.account.balance).with_store(store);
    let h = harness(config, FakeBroker::new(Behaviour::Fill, dec!(100)), ledger);
    let mut alerts = h.alerts.subscribe();

    let (tx, source) = ChannelSignalSource::new(16);
    tx.send(stock_signal("AMZN", dec!(180))).await.unwrap();
    let shutdown = Arc::new(GracefulShutdown::with_defaults());

    let result = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        Arc::clone(&h.engine).run(source, shutdown),
    )
    .await
    .expect("run should return instead of starting intake");

    assert!(matches!(result, Err(PilotError::Persistence(_))));
    assert!(h.broker.placed().is_empty());
    assert!(h.engine.ledger().list(None).await.is_empty());
    assert_eq!(std::fs::read_to_string(&ledger_path).unwrap(), damaged);
    assert!(dir.path().join("ledger.json.corrupt").exists());

    let alert = alerts.try_recv().unwrap();
    assert_eq!(alert.level, AlertLevel::Critical);
    assert_eq!(alert.title, "Ledger restore failed");
}
