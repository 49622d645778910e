//! Exit Monitor
//!
//! Evaluates OPEN positions against live quotes and closes them on
//! stop-loss, take-profit, trailing stop or max hold time, in that order.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ExecutionConfig, ExitConfig};
use crate::domain::{
    ExitReason, OrderOutcome, OrderRequest, Position, PositionId, PositionStatus, TransitionReason,
};
use crate::error::{PilotError, Result};
use crate::exchange::PriceFeed;
use crate::supervisor::AlertManager;

use super::executor::OrderSubmitter;
use super::ledger::PositionLedger;

/// First matching exit condition for `position` at `price`, if any.
///
/// Expects the high-water mark to already include `price`.
pub fn evaluate(
    position: &Position,
    price: Decimal,
    now: DateTime<Utc>,
    config: &ExitConfig,
) -> Option<ExitReason> {
    let hundred = Decimal::from(100);
    let return_pct = position.return_pct(price);

    if return_pct <= -config.stop_loss_percent {
        return Some(ExitReason::StopLoss);
    }

    if return_pct >= config.take_profit_percent {
        return Some(ExitReason::TakeProfit);
    }

    // Trailing stop arms once the position has moved in our favour
    if config.trailing_stop_percent > Decimal::ZERO {
        let trail = config.trailing_stop_percent / hundred;
        let triggered = if position.is_long() {
            position.high_water > position.entry_price
                && price <= position.high_water * (Decimal::ONE - trail)
        } else {
            position.high_water < position.entry_price
                && price >= position.high_water * (Decimal::ONE + trail)
        };
        if triggered {
            return Some(ExitReason::TrailingStop);
        }
    }

    if now >= position.deadline {
        return Some(ExitReason::MaxHoldTime);
    }

    None
}

/// Limit price for a closing order: offset toward the worse side to improve fill odds
pub fn closing_limit_price(position: &Position, price: Decimal, offset_percent: Decimal) -> Decimal {
    let offset = offset_percent / Decimal::from(100);
    let limit = if position.is_long() {
        // Selling to close
        price * (Decimal::ONE - offset)
    } else {
        price * (Decimal::ONE + offset)
    };
    limit.round_dp(2)
}

/// What one evaluation pass did with a position
#[derive(Debug, Clone, PartialEq)]
pub enum ExitCheck {
    /// Another pass is already handling this position
    Busy,
    /// Position is not OPEN
    NotOpen,
    QuoteUnavailable,
    Hold,
    Closed(Position),
    /// Exit order did not fill; position is OPEN again
    Abandoned(Position),
    /// Exit order state unknown; position is FAILED
    Failed(Position),
}

/// Serialized-per-position exit evaluation
pub struct ExitMonitor {
    ledger: Arc<PositionLedger>,
    submitter: Arc<OrderSubmitter>,
    quotes: Arc<dyn PriceFeed>,
    alerts: Arc<AlertManager>,
    exit: ExitConfig,
    execution: ExecutionConfig,
    in_flight: DashMap<PositionId, Arc<Mutex<()>>>,
}

impl ExitMonitor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        submitter: Arc<OrderSubmitter>,
        quotes: Arc<dyn PriceFeed>,
        alerts: Arc<AlertManager>,
        exit: ExitConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            ledger,
            submitter,
            quotes,
            alerts,
            exit,
            execution,
            in_flight: DashMap::new(),
        }
    }

    /// Evaluate one position once; skipped when another pass holds it
    pub async fn check_position(&self, id: PositionId) -> Result<ExitCheck> {
        let lock = self
            .in_flight
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(guard) = lock.try_lock() else {
            debug!(position_id = %id, "Exit evaluation already running, skipping");
            return Ok(ExitCheck::Busy);
        };

        let result = self.evaluate_locked(id).await;

        let done = matches!(
            result,
            Ok(ExitCheck::Closed(_)) | Ok(ExitCheck::Failed(_)) | Ok(ExitCheck::NotOpen)
        );
        drop(guard);
        if done {
            self.in_flight.remove(&id);
        }
        result
    }

    async fn evaluate_locked(&self, id: PositionId) -> Result<ExitCheck> {
        let Some(position) = self.ledger.get(id).await else {
            return Err(PilotError::PositionNotFound(id));
        };
        if position.status != PositionStatus::Open {
            return Ok(ExitCheck::NotOpen);
        }

        let key = position.key();
        let price = match self.quotes.quote(&key).await {
            Ok(price) => price,
            Err(e) => {
                debug!(position_id = %id, "No quote for {}: {}", key, e);
                return Ok(ExitCheck::QuoteUnavailable);
            }
        };

        // High-water first, so the trailing stop sees this tick
        let Some(position) = self.ledger.mark_price(id, price).await else {
            return Err(PilotError::PositionNotFound(id));
        };
        if position.status != PositionStatus::Open {
            return Ok(ExitCheck::NotOpen);
        }

        let Some(reason) = evaluate(&position, price, Utc::now(), &self.exit) else {
            return Ok(ExitCheck::Hold);
        };

        info!(
            position_id = %id,
            "Exit trigger {} for {} at {} (entry {}, return {:.2}%)",
            reason,
            key,
            price,
            position.entry_price,
            position.return_pct(price)
        );

        let position = match self
            .ledger
            .transition(
                id,
                PositionStatus::PendingExit,
                TransitionReason::ExitTriggered(reason),
            )
            .await
        {
            Ok(position) => position,
            Err(e @ PilotError::InvalidStateTransition { .. }) => {
                self.alerts.defect("exit_monitor", &e.to_string()).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.alerts.exit_triggered(&position, reason, price).await;

        let request = self.closing_order(&position, price);
        let submitted = self.submitter.submit(&request).await;

        self.commit_exit(&position, reason, submitted).await
    }

    /// One fresh client request id per exit attempt; retries inside the submitter reuse it
    fn closing_order(&self, position: &Position, price: Decimal) -> OrderRequest {
        let request = OrderRequest::new(
            format!("exit-{}-{}", position.id, Utc::now().timestamp_millis()),
            position.symbol.clone(),
            &position.instrument,
            position.side.opposite(),
            position.quantity,
        )
        .with_time_in_force(self.execution.time_in_force);

        if self.exit.use_market_orders {
            request
        } else {
            request.with_limit(closing_limit_price(
                position,
                price,
                self.exit.limit_order_offset_percent,
            ))
        }
    }

    async fn commit_exit(
        &self,
        position: &Position,
        reason: ExitReason,
        submitted: Result<OrderOutcome>,
    ) -> Result<ExitCheck> {
        let id = position.id;
        match submitted {
            Ok(OrderOutcome::Filled {
                order_id,
                fill_price,
                filled_quantity,
            }) => {
                let position = self
                    .ledger
                    .close(id, fill_price, filled_quantity, Some(order_id))
                    .await?;
                if position.status == PositionStatus::Closed {
                    self.alerts.position_closed(&position).await;
                    Ok(ExitCheck::Closed(position))
                } else {
                    warn!(
                        position_id = %id,
                        "Exit partially filled, {} remaining", position.quantity
                    );
                    Ok(ExitCheck::Abandoned(position))
                }
            }
            Ok(OrderOutcome::Rejected { reason: detail, .. }) => {
                self.alerts
                    .order_rejected("exit_monitor", position, &detail)
                    .await;
                let position = self
                    .ledger
                    .transition(
                        id,
                        PositionStatus::Open,
                        TransitionReason::ExitAbandoned(detail),
                    )
                    .await?;
                Ok(ExitCheck::Abandoned(position))
            }
            Ok(OrderOutcome::Cancelled { .. }) => {
                warn!(
                    position_id = %id,
                    "{} exit order cancelled unfilled, monitoring resumes", reason
                );
                let position = self
                    .ledger
                    .transition(
                        id,
                        PositionStatus::Open,
                        TransitionReason::ExitAbandoned("exit order cancelled unfilled".into()),
                    )
                    .await?;
                Ok(ExitCheck::Abandoned(position))
            }
            Err(e) if e.requires_reconciliation() => {
                error!(position_id = %id, "Exit order needs reconciliation: {}", e);
                let position = self
                    .ledger
                    .transition(
                        id,
                        PositionStatus::Failed,
                        TransitionReason::ReconciliationRequired(e.to_string()),
                    )
                    .await?;
                self.alerts
                    .reconciliation_required(&position, &e.to_string())
                    .await;
                Ok(ExitCheck::Failed(position))
            }
            Err(e) => {
                // Submitter resolves transport failures itself; anything else leaves the order unknown
                error!(position_id = %id, "Exit submission failed: {}", e);
                let position = self
                    .ledger
                    .transition(
                        id,
                        PositionStatus::Failed,
                        TransitionReason::ReconciliationRequired(e.to_string()),
                    )
                    .await?;
                self.alerts
                    .reconciliation_required(&position, &e.to_string())
                    .await;
                Ok(ExitCheck::Failed(position))
            }
        }
    }
}
