//! Execution Loop
//!
//! Restores the ledger, resumes exit monitoring, then turns inbound signals
//! into positions. Shutdown stops intake, waits for in-flight orders and
//! flushes the ledger.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::coordination::GracefulShutdown;
use crate::domain::{
    OrderOutcome, OrderRequest, OrderSide, OrderType, Position, PositionStatus, Signal,
    TransitionReason,
};
use crate::error::{GateRejection, PilotError, Result, RiskRejection};
use crate::exchange::{BrokerClient, PriceFeed, SignalSource};
use crate::supervisor::AlertManager;

use super::executor::OrderSubmitter;
use super::exit_monitor::{ExitCheck, ExitMonitor};
use super::ledger::{Admission, PositionLedger};

/// What happened to one inbound signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Dropped by the signal gate; nothing reserved
    Gated(GateRejection),
    /// Dropped by the risk sizer; nothing reserved
    RiskLimited(RiskRejection),
    Opened(Position),
    /// Broker refused the entry; position FAILED, risk refunded
    Rejected(Position),
    /// Entry timed out and the cancel was confirmed; position FAILED, risk refunded
    Cancelled(Position),
    /// Entry order state unknown; position FAILED pending reconciliation
    Unreconciled(Position),
}

/// Limit price for an entry: offset toward the worse side to improve fill odds
pub fn entry_limit_price(side: OrderSide, price: Decimal, offset_percent: Decimal) -> Decimal {
    let offset = offset_percent / Decimal::from(100);
    let limit = match side {
        OrderSide::Buy => price * (Decimal::ONE + offset),
        OrderSide::Sell => price * (Decimal::ONE - offset),
    };
    limit.round_dp(2)
}

/// Signal-to-position pipeline
pub struct ExecutionEngine {
    config: AppConfig,
    watchlist: HashSet<String>,
    ledger: Arc<PositionLedger>,
    submitter: Arc<OrderSubmitter>,
    exit_monitor: Arc<ExitMonitor>,
    quotes: Arc<dyn PriceFeed>,
    alerts: Arc<AlertManager>,
    submissions: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(
        config: AppConfig,
        ledger: Arc<PositionLedger>,
        broker: Arc<dyn BrokerClient>,
        quotes: Arc<dyn PriceFeed>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let submitter = Arc::new(OrderSubmitter::new(broker, config.execution.clone()));
        let exit_monitor = Arc::new(ExitMonitor::new(
            Arc::clone(&ledger),
            Arc::clone(&submitter),
            Arc::clone(&quotes),
            Arc::clone(&alerts),
            config.exit.clone(),
            config.execution.clone(),
        ));
        let submissions = Arc::new(Semaphore::new(config.execution.max_concurrent_submissions.max(1)));

        Self {
            watchlist: config.watchlist_set(),
            config,
            ledger,
            submitter,
            exit_monitor,
            quotes,
            alerts,
            submissions,
        }
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    pub fn exit_monitor(&self) -> &Arc<ExitMonitor> {
        &self.exit_monitor
    }

    /// Reload persisted positions; returns how many are OPEN and monitored
    pub async fn restore(&self) -> Result<usize> {
        let unknown = self.ledger.restore().await?;
        for position in &unknown {
            self.alerts
                .reconciliation_required(position, "order in flight at restart, broker state unknown")
                .await;
        }

        let open = self.ledger.list(Some(PositionStatus::Open)).await.len();
        if open > 0 {
            info!("Resuming exit monitoring for {} open positions", open);
        }
        Ok(open)
    }

    /// Gate, size, reserve, submit and commit one signal
    pub async fn process_signal(&self, signal: &Signal) -> Result<SignalOutcome> {
        let now = Utc::now();

        let unit_price = match signal.reference_price {
            Some(price) => price,
            None => match self.quotes.quote(&signal.key()).await {
                Ok(price) => price,
                Err(e) => {
                    debug!("No price for {}: {}", signal.key(), e);
                    return Ok(SignalOutcome::Gated(GateRejection::MissingMarketData {
                        field: "reference_price",
                    }));
                }
            },
        };

        let admission = Admission {
            watchlist: &self.watchlist,
            entry: &self.config.entry,
            risk: &self.config.risk,
            unit_price,
            max_hold: self.config.exit.max_hold(),
            now,
        };

        let position = match self.ledger.reserve(signal, admission).await {
            Ok(position) => position,
            Err(PilotError::Validation(rejection)) => {
                info!(
                    signal_id = %signal.id,
                    "Signal for {} from {} skipped: {}", signal.key(), signal.source, rejection
                );
                return Ok(SignalOutcome::Gated(rejection));
            }
            Err(PilotError::RiskLimitExceeded(rejection)) => {
                info!(
                    signal_id = %signal.id,
                    "Signal for {} skipped by risk limits: {}", signal.key(), rejection
                );
                return Ok(SignalOutcome::RiskLimited(rejection));
            }
            Err(e) => return Err(e),
        };

        info!(
            position_id = %position.id,
            client_request_id = %position.client_request_id,
            "Submitting {} {} x{} @ {} (strength {}, ${} reserved)",
            position.side,
            position.key(),
            position.quantity,
            unit_price,
            signal.strength,
            position.reserved_amount
        );

        let request = self.entry_order(&position, unit_price);
        let submitted = self.submitter.submit(&request).await;
        self.commit_entry(position, submitted).await
    }

    fn entry_order(&self, position: &Position, unit_price: Decimal) -> OrderRequest {
        let request = OrderRequest::new(
            position.client_request_id.clone(),
            position.symbol.clone(),
            &position.instrument,
            position.side,
            position.quantity,
        )
        .with_time_in_force(self.config.execution.time_in_force);

        match self.config.execution.order_type {
            OrderType::Market => request,
            OrderType::Limit => request.with_limit(entry_limit_price(
                position.side,
                unit_price,
                self.config.exit.limit_order_offset_percent,
            )),
        }
    }

    async fn commit_entry(
        &self,
        position: Position,
        submitted: Result<OrderOutcome>,
    ) -> Result<SignalOutcome> {
        let id = position.id;
        match submitted {
            Ok(outcome @ OrderOutcome::Filled { .. }) => {
                let opened = match self.ledger.open(id, &outcome).await {
                    Ok(opened) => opened,
                    Err(e @ PilotError::InvalidStateTransition { .. }) => {
                        self.alerts.defect("execution_loop", &e.to_string()).await;
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                };
                self.alerts.position_opened(&opened).await;
                Ok(SignalOutcome::Opened(opened))
            }
            Ok(OrderOutcome::Rejected { reason, .. }) => {
                self.alerts
                    .order_rejected("execution_loop", &position, &reason)
                    .await;
                let failed = self
                    .ledger
                    .transition(id, PositionStatus::Failed, TransitionReason::EntryRejected(reason))
                    .await?;
                Ok(SignalOutcome::Rejected(failed))
            }
            Ok(OrderOutcome::Cancelled { .. }) => {
                warn!(position_id = %id, "Entry for {} cancelled unfilled", position.key());
                let failed = self
                    .ledger
                    .transition(id, PositionStatus::Failed, TransitionReason::EntryCancelled)
                    .await?;
                Ok(SignalOutcome::Cancelled(failed))
            }
            Err(e) => {
                if !e.requires_reconciliation() {
                    error!(position_id = %id, "Entry submission failed: {}", e);
                }
                let failed = self
                    .ledger
                    .transition(
                        id,
                        PositionStatus::Failed,
                        TransitionReason::ReconciliationRequired(e.to_string()),
                    )
                    .await?;
                self.alerts
                    .reconciliation_required(&failed, &e.to_string())
                    .await;
                Ok(SignalOutcome::Unreconciled(failed))
            }
        }
    }

    /// Evaluate every OPEN position once, in parallel; returns how many closed
    pub async fn run_exit_pass(&self) -> usize {
        let open = self.ledger.list(Some(PositionStatus::Open)).await;
        let mut checks = JoinSet::new();
        for position in open {
            let monitor = Arc::clone(&self.exit_monitor);
            checks.spawn(async move { (position.id, monitor.check_position(position.id).await) });
        }

        let mut closed = 0;
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((_, Ok(ExitCheck::Closed(_)))) => closed += 1,
                Ok((_, Ok(_))) => {}
                Ok((id, Err(e))) => error!(position_id = %id, "Exit check failed: {}", e),
                Err(e) => error!("Exit check task panicked: {}", e),
            }
        }
        closed
    }

    /// Run until shutdown is requested, then drain and flush
    pub async fn run<S>(
        self: Arc<Self>,
        mut source: S,
        shutdown: Arc<GracefulShutdown>,
    ) -> Result<()>
    where
        S: SignalSource + 'static,
    {
        // Intake never starts on a ledger that failed to load
        let open = match self.restore().await {
            Ok(open) => open,
            Err(e) => {
                error!("Failed to restore ledger, not starting: {}", e);
                self.alerts
                    .critical("execution_loop", "Ledger restore failed", &e.to_string())
                    .await;
                return Err(e);
            }
        };
        info!("Ledger restored, {} open positions", open);

        // Open positions are checked before the first signal is read
        self.run_exit_pass().await;
        let exit_loop = tokio::spawn(Arc::clone(&self).exit_loop(Arc::clone(&shutdown)));

        let mut token = shutdown.token();
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.schedule.check_signals_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            "Execution loop started (signals every {}ms, exits every {}ms)",
            self.config.schedule.check_signals_interval_ms,
            self.config.schedule.exit_poll_interval_ms
        );

        loop {
            tokio::select! {
                signal = token.wait_for_shutdown() => {
                    info!("Execution loop stopping ({})", signal);
                    break;
                }
                _ = interval.tick() => {
                    while let Some(joined) = in_flight.try_join_next() {
                        if let Err(e) = joined {
                            error!("Signal task panicked: {}", e);
                        }
                    }
                    match source.poll().await {
                        Ok(signals) => {
                            if !signals.is_empty() {
                                debug!("Received {} signals", signals.len());
                            }
                            for signal in signals {
                                Self::spawn_signal(&self, &mut in_flight, signal).await;
                            }
                        }
                        Err(e) => warn!("Signal source poll failed: {}", e),
                    }
                }
            }
        }

        let ledger = Arc::clone(&self.ledger);
        shutdown
            .execute(
                || async move {
                    drop(source);
                },
                || async move {
                    let mut clean = true;
                    while let Some(joined) = in_flight.join_next().await {
                        if let Err(e) = joined {
                            error!("Signal task panicked during drain: {}", e);
                            clean = false;
                        }
                    }
                    if let Err(e) = exit_loop.await {
                        error!("Exit loop panicked: {}", e);
                        clean = false;
                    }
                    clean
                },
                || async move { ledger.flush().await.map_err(|e| e.to_string()) },
            )
            .await?;
        Ok(())
    }

    async fn spawn_signal(engine: &Arc<Self>, in_flight: &mut JoinSet<()>, signal: Signal) {
        let permit = match Arc::clone(&engine.submissions).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Submission limiter closed, dropping signal {}", signal.id);
                return;
            }
        };
        let engine = Arc::clone(engine);
        in_flight.spawn(async move {
            let _permit = permit;
            if let Err(e) = engine.process_signal(&signal).await {
                error!(signal_id = %signal.id, "Signal processing failed: {}", e);
            }
        });
    }

    async fn exit_loop(self: Arc<Self>, shutdown: Arc<GracefulShutdown>) {
        let mut token = shutdown.token();
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.schedule.exit_poll_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.wait_for_shutdown() => break,
                _ = interval.tick() => {
                    let closed = self.run_exit_pass().await;
                    if closed > 0 {
                        info!("Exit pass closed {} positions", closed);
                    }
                    self.ledger.prune(Utc::now()).await;
                }
            }
        }
        debug!("Exit loop stopped");
    }
}
