//! Position Ledger
//!
//! The single shared mutable resource of the engine. Position table and risk
//! counters live behind one mutex so admission (gate + sizing + reservation)
//! is one atomic step. Broker calls never run under the lock: callers reserve,
//! release, talk to the broker, then commit the result.
//!
//! Finished positions are dropped once they leave the retention window; the
//! trade log keeps their history.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{capped_seconds, AppConfig, EntryConfig, RiskConfig};
use crate::domain::{
    OrderOutcome, Position, PositionId, PositionStatus, Signal, StateTransition, TransitionReason,
};
use crate::error::{GateRejection, PilotError, Result};
use crate::persistence::{LedgerSnapshot, LedgerStore};

use super::gate;
use super::risk::{self, RiskState};

/// Inputs the admission step needs besides the signal itself
#[derive(Debug, Clone, Copy)]
pub struct Admission<'a> {
    pub watchlist: &'a HashSet<String>,
    pub entry: &'a EntryConfig,
    pub risk: &'a RiskConfig,
    /// Price of one quantity unit before the contract multiplier
    pub unit_price: Decimal,
    pub max_hold: Duration,
    pub now: DateTime<Utc>,
}

/// How long finished positions stay in the ledger
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// CLOSED/FAILED positions are dropped this long after they finish
    pub keep_terminal: Duration,
    /// Drop request ids along with their positions. Only sound when
    /// `keep_terminal` covers the stale-signal cutoff, so a redelivery is
    /// refused as stale instead.
    pub forget_requests: bool,
    /// Minimum gap between snapshots written only for a high-water move
    pub high_water_save_interval: Duration,
}

impl Retention {
    pub fn from_config(config: &AppConfig) -> Self {
        let entry = &config.entry;
        let keep = config
            .persistence
            .terminal_retention_secs
            .max(entry.duplicate_window_secs)
            .max(entry.max_signal_age_secs);
        Self {
            keep_terminal: capped_seconds(keep),
            forget_requests: entry.max_signal_age_secs > 0,
            high_water_save_interval: capped_seconds(
                config.persistence.high_water_save_interval_secs,
            ),
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_terminal: Duration::hours(24),
            forget_requests: false,
            high_water_save_interval: Duration::seconds(30),
        }
    }
}

#[derive(Debug)]
struct LedgerInner {
    positions: HashMap<PositionId, Position>,
    /// Entry client request id -> position
    by_request: HashMap<String, PositionId>,
    /// Entry request ids of positions no longer in the table
    retired_requests: HashSet<String>,
    risk: RiskState,
    version: u64,
    high_water_saved_at: Option<DateTime<Utc>>,
}

impl LedgerInner {
    fn snapshot(&self) -> LedgerSnapshot {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by_key(|p| p.opened_at);
        let mut retired_requests: Vec<String> = self.retired_requests.iter().cloned().collect();
        retired_requests.sort();
        LedgerSnapshot {
            version: self.version,
            saved_at: Utc::now(),
            risk: self.risk.clone(),
            positions,
            retired_requests,
        }
    }

    fn seen_request(&self, client_request_id: &str) -> bool {
        self.by_request.contains_key(client_request_id)
            || self.retired_requests.contains(client_request_id)
    }

    /// Drop finished positions older than the retention window
    fn prune(&mut self, now: DateTime<Utc>, retention: &Retention) -> usize {
        let cutoff = now - retention.keep_terminal;
        let expired: Vec<PositionId> = self
            .positions
            .values()
            .filter(|p| p.status.is_terminal() && p.closed_at.map_or(false, |at| at < cutoff))
            .map(|p| p.id)
            .collect();

        for id in &expired {
            if let Some(position) = self.positions.remove(id) {
                self.by_request.remove(&position.client_request_id);
                if !retention.forget_requests {
                    self.retired_requests.insert(position.client_request_id);
                }
            }
        }
        if !expired.is_empty() {
            self.version += 1;
        }
        expired.len()
    }

    /// Apply one state change; no-op on error
    fn apply(
        &mut self,
        id: PositionId,
        to: PositionStatus,
        reason: TransitionReason,
    ) -> std::result::Result<(Position, StateTransition), PilotError> {
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(PilotError::PositionNotFound(id))?;
        let from = position.status;

        if !from.can_transition_to(to) {
            return Err(PilotError::InvalidStateTransition {
                position_id: id,
                from,
                to,
            });
        }

        let now = Utc::now();
        position.status = to;
        position.updated_at = now;
        if let TransitionReason::ExitTriggered(exit) = &reason {
            position.exit_reason = Some(*exit);
        }
        position.last_reason = Some(reason.clone());
        if to.is_terminal() {
            position.closed_at = Some(now);
        }

        let refund = if from == PositionStatus::PendingEntry
            && to == PositionStatus::Failed
            && reason.refunds_risk()
            && position.opened_at.date_naive() == self.risk.day
        {
            position.reserved_amount
        } else {
            Decimal::ZERO
        };

        let event = StateTransition::new(position, from, to, reason);
        let snapshot = position.clone();

        if to.is_terminal() {
            self.risk.open_position_count = self.risk.open_position_count.saturating_sub(1);
        }
        if refund > Decimal::ZERO {
            self.risk.risk_used_today = (self.risk.risk_used_today - refund).max(Decimal::ZERO);
        }
        self.version += 1;

        Ok((snapshot, event))
    }

    /// Move a live position to FAILED after an illegal transition request
    fn quarantine(&mut self, id: PositionId, detail: String) -> Option<StateTransition> {
        let position = self.positions.get_mut(&id)?;
        if position.status.is_terminal() {
            return None;
        }
        let from = position.status;
        let now = Utc::now();
        let reason = TransitionReason::Quarantined(detail);

        position.status = PositionStatus::Failed;
        position.updated_at = now;
        position.closed_at = Some(now);
        position.last_reason = Some(reason.clone());

        let event = StateTransition::new(position, from, PositionStatus::Failed, reason);
        self.risk.open_position_count = self.risk.open_position_count.saturating_sub(1);
        self.version += 1;
        Some(event)
    }
}

/// In-memory position table with write-through persistence
pub struct PositionLedger {
    inner: Mutex<LedgerInner>,
    store: Option<Arc<dyn LedgerStore>>,
    retention: Retention,
}

impl PositionLedger {
    pub fn new(account_balance: Decimal) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                positions: HashMap::new(),
                by_request: HashMap::new(),
                retired_requests: HashSet::new(),
                risk: RiskState::new(account_balance),
                version: 0,
                high_water_saved_at: None,
            }),
            store: None,
            retention: Retention::default(),
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Persist every change to `store`
    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Gate, size and reserve in one critical section.
    ///
    /// On success a PENDING_ENTRY position exists, it counts against
    /// `max_open_positions`, and its amount is charged to the daily budget.
    pub async fn reserve(&self, signal: &Signal, admission: Admission<'_>) -> Result<Position> {
        let (position, snapshot) = {
            let mut inner = self.inner.lock().await;

            if inner.risk.roll_day(admission.now.date_naive()) {
                info!("New trading day {}, daily risk budget reset", inner.risk.day);
            }

            let pruned = inner.prune(admission.now, &self.retention);
            if pruned > 0 {
                debug!("Dropped {} finished positions past retention", pruned);
            }

            if inner.seen_request(&signal.entry_request_id()) {
                return Err(GateRejection::DuplicateSignal {
                    signal_id: signal.id,
                }
                .into());
            }

            gate::admit(
                signal,
                admission.watchlist,
                inner.positions.values(),
                admission.entry,
                admission.now,
            )?;

            let amount = risk::size_for(signal.strength, &inner.risk, admission.risk)?;
            let unit_cost = admission.unit_price * signal.instrument.multiplier();
            let quantity = risk::units_for(amount, unit_cost, signal.quantity)?;

            let position = Position::pending(
                signal,
                quantity,
                admission.unit_price,
                amount,
                admission.max_hold,
            );

            inner.risk.open_position_count += 1;
            inner.risk.risk_used_today += amount;
            inner
                .by_request
                .insert(position.client_request_id.clone(), position.id);
            inner.positions.insert(position.id, position.clone());
            inner.version += 1;

            debug!(
                position_id = %position.id,
                "Reserved ${} for {} (open {}, used today ${})",
                amount,
                position.key(),
                inner.risk.open_position_count,
                inner.risk.risk_used_today
            );

            (position, inner.snapshot())
        };

        self.persist(Some(snapshot), Vec::new()).await;
        Ok(position)
    }

    /// PENDING_ENTRY -> OPEN on a confirmed entry fill
    pub async fn open(&self, id: PositionId, outcome: &OrderOutcome) -> Result<Position> {
        let OrderOutcome::Filled {
            order_id,
            fill_price,
            filled_quantity,
        } = outcome
        else {
            return Err(PilotError::Internal(format!(
                "cannot open position {} from non-fill outcome {:?}",
                id, outcome
            )));
        };

        let result = {
            let mut inner = self.inner.lock().await;
            let applied = inner.apply(id, PositionStatus::Open, TransitionReason::EntryFilled);
            match applied {
                Ok((_, event)) => {
                    let position = inner
                        .positions
                        .get_mut(&id)
                        .ok_or(PilotError::PositionNotFound(id))?;
                    let now = Utc::now();
                    let max_hold = position.deadline - position.opened_at;

                    position.entry_order_id = Some(order_id.clone());
                    position.entry_price = *fill_price;
                    position.high_water = *fill_price;
                    position.quantity = *filled_quantity;
                    position.opened_at = now;
                    position.deadline = now + max_hold;

                    let position = position.clone();
                    Ok((position, event, inner.snapshot()))
                }
                Err(e) => Err(self.quarantine_locked(&mut inner, id, e)),
            }
        };

        self.finish(result).await
    }

    /// Drive a position through the state machine.
    ///
    /// An illegal transition moves a live position to FAILED and returns
    /// `InvalidStateTransition`.
    pub async fn transition(
        &self,
        id: PositionId,
        to: PositionStatus,
        reason: TransitionReason,
    ) -> Result<Position> {
        let result = {
            let mut inner = self.inner.lock().await;
            match inner.apply(id, to, reason) {
                Ok((position, event)) => Ok((position, event, inner.snapshot())),
                Err(e) => Err(self.quarantine_locked(&mut inner, id, e)),
            }
        };

        self.finish(result).await
    }

    /// Commit a confirmed closing fill.
    ///
    /// A full fill moves PENDING_EXIT -> CLOSED and realizes P&L into the
    /// account balance. A partial fill realizes the filled part and returns
    /// the remainder to OPEN.
    pub async fn close(
        &self,
        id: PositionId,
        exit_price: Decimal,
        filled_quantity: u64,
        exit_order_id: Option<String>,
    ) -> Result<Position> {
        let result = {
            let mut inner = self.inner.lock().await;

            let Some(current) = inner.positions.get(&id).cloned() else {
                return Err(PilotError::PositionNotFound(id));
            };
            let exit_reason = current.exit_reason;
            let closes_all = filled_quantity >= current.quantity;

            let (to, reason) = if closes_all {
                let reason = match exit_reason {
                    Some(r) => TransitionReason::ExitFilled(r),
                    None => TransitionReason::ExitAbandoned("exit fill without trigger".into()),
                };
                (PositionStatus::Closed, reason)
            } else {
                (
                    PositionStatus::Open,
                    TransitionReason::ExitAbandoned(format!(
                        "partial exit fill {} of {}",
                        filled_quantity, current.quantity
                    )),
                )
            };

            match inner.apply(id, to, reason) {
                Ok((_, event)) => {
                    let filled = filled_quantity.min(current.quantity);
                    let pnl = current.pnl_for(exit_price, filled);
                    let cash = current.cash_value(pnl);
                    inner.risk.account_balance += cash;

                    let position = inner
                        .positions
                        .get_mut(&id)
                        .ok_or(PilotError::PositionNotFound(id))?;
                    position.realized_pnl = Some(position.realized_pnl.unwrap_or_default() + pnl);
                    position.realized_cash_pnl =
                        Some(position.realized_cash_pnl.unwrap_or_default() + cash);
                    position.exit_order_id = exit_order_id;
                    if closes_all {
                        position.exit_price = Some(exit_price);
                    } else {
                        position.quantity -= filled;
                        position.exit_reason = None;
                    }

                    let position = position.clone();
                    Ok((position, event, inner.snapshot()))
                }
                Err(e) => Err(self.quarantine_locked(&mut inner, id, e)),
            }
        };

        self.finish(result).await
    }

    /// Feed a price to an OPEN position's high-water mark; returns its current state
    pub async fn mark_price(&self, id: PositionId, price: Decimal) -> Option<Position> {
        let (position, snapshot) = {
            let mut inner = self.inner.lock().await;
            let position = inner.positions.get_mut(&id)?;
            let moved =
                position.status == PositionStatus::Open && position.update_high_water(price);
            let position = position.clone();
            if !moved {
                return Some(position);
            }

            // Later snapshots carry the mark when this one is skipped
            inner.version += 1;
            let now = Utc::now();
            let due = inner
                .high_water_saved_at
                .map_or(true, |at| now - at >= self.retention.high_water_save_interval);
            if due {
                inner.high_water_saved_at = Some(now);
                (position, Some(inner.snapshot()))
            } else {
                (position, None)
            }
        };

        if snapshot.is_some() {
            self.persist(snapshot, Vec::new()).await;
        }
        Some(position)
    }

    /// Drop finished positions past the retention window; returns how many went
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let (pruned, snapshot) = {
            let mut inner = self.inner.lock().await;
            let pruned = inner.prune(now, &self.retention);
            (pruned, (pruned > 0).then(|| inner.snapshot()))
        };
        if pruned > 0 {
            debug!("Dropped {} finished positions past retention", pruned);
            self.persist(snapshot, Vec::new()).await;
        }
        pruned
    }

    pub async fn get(&self, id: PositionId) -> Option<Position> {
        self.inner.lock().await.positions.get(&id).cloned()
    }

    /// Positions, oldest first, optionally filtered by status
    pub async fn list(&self, status: Option<PositionStatus>) -> Vec<Position> {
        let inner = self.inner.lock().await;
        let mut positions: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.opened_at);
        positions
    }

    pub async fn find_by_request(&self, client_request_id: &str) -> Option<Position> {
        let inner = self.inner.lock().await;
        let id = inner.by_request.get(client_request_id)?;
        inner.positions.get(id).cloned()
    }

    pub async fn risk_state(&self) -> RiskState {
        self.inner.lock().await.risk.clone()
    }

    pub async fn open_position_count(&self) -> u32 {
        self.inner.lock().await.risk.open_position_count
    }

    /// Reload the persisted ledger.
    ///
    /// Positions that had an order in flight are moved to FAILED since their
    /// broker state is unknown; they are returned for alerting. Open positions
    /// resume as they were.
    pub async fn restore(&self) -> Result<Vec<Position>> {
        let Some(store) = &self.store else {
            return Ok(Vec::new());
        };
        let Some(snapshot) = store.load_snapshot().await? else {
            info!("No persisted ledger found, starting empty");
            return Ok(Vec::new());
        };

        let (unknown, events, snapshot) = {
            let mut inner = self.inner.lock().await;
            inner.positions.clear();
            inner.by_request.clear();
            inner.retired_requests = snapshot.retired_requests.into_iter().collect();
            inner.risk = snapshot.risk;
            inner.version = snapshot.version;

            let mut unknown = Vec::new();
            let mut events = Vec::new();
            for mut position in snapshot.positions {
                if position.status.has_pending_order() {
                    let from = position.status;
                    let now = Utc::now();
                    position.status = PositionStatus::Failed;
                    position.closed_at = Some(now);
                    position.updated_at = now;
                    position.last_reason = Some(TransitionReason::RestoredUnknown);
                    events.push(StateTransition::new(
                        &position,
                        from,
                        PositionStatus::Failed,
                        TransitionReason::RestoredUnknown,
                    ));
                    unknown.push(position.clone());
                }
                inner
                    .by_request
                    .insert(position.client_request_id.clone(), position.id);
                inner.positions.insert(position.id, position);
            }

            let live = inner
                .positions
                .values()
                .filter(|p| p.status.is_live())
                .count();
            inner.risk.open_position_count = u32::try_from(live).unwrap_or(u32::MAX);
            inner.risk.roll_day(Utc::now().date_naive());
            inner.prune(Utc::now(), &self.retention);
            inner.version += 1;

            info!(
                "Restored {} positions ({} live, {} with unknown broker state)",
                inner.positions.len(),
                live,
                unknown.len()
            );
            (unknown, events, inner.snapshot())
        };

        for position in &unknown {
            error!(
                position_id = %position.id,
                client_request_id = %position.client_request_id,
                "Restored {} with an order in flight; marked FAILED for reconciliation",
                position.key()
            );
        }

        self.persist(Some(snapshot), events).await;
        Ok(unknown)
    }

    /// Write the current state regardless of pending changes
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = {
            let mut inner = self.inner.lock().await;
            inner.version += 1;
            inner.snapshot()
        };
        store.save_snapshot(&snapshot).await?;
        info!(
            "Flushed ledger v{} ({} positions)",
            snapshot.version,
            snapshot.positions.len()
        );
        Ok(())
    }

    fn quarantine_locked(
        &self,
        inner: &mut LedgerInner,
        id: PositionId,
        err: PilotError,
    ) -> Quarantine {
        let event = match &err {
            PilotError::InvalidStateTransition { from, to, .. } => {
                error!(
                    position_id = %id,
                    "Ledger defect: illegal transition {} -> {}, quarantining position", from, to
                );
                inner.quarantine(id, format!("illegal transition {} -> {}", from, to))
            }
            _ => None,
        };
        let snapshot = event.as_ref().map(|_| inner.snapshot());
        Quarantine { err, event, snapshot }
    }

    async fn finish(
        &self,
        result: std::result::Result<(Position, StateTransition, LedgerSnapshot), Quarantine>,
    ) -> Result<Position> {
        match result {
            Ok((position, event, snapshot)) => {
                info!(
                    position_id = %position.id,
                    "{} {} -> {} ({})", position.key(), event.from, event.to, event.reason
                );
                self.persist(Some(snapshot), vec![event]).await;
                Ok(position)
            }
            Err(Quarantine {
                err,
                event,
                snapshot,
            }) => {
                if let Some(event) = event {
                    self.persist(snapshot, vec![event]).await;
                }
                Err(err)
            }
        }
    }

    async fn persist(&self, snapshot: Option<LedgerSnapshot>, events: Vec<StateTransition>) {
        let Some(store) = &self.store else {
            return;
        };
        for event in &events {
            if let Err(e) = store.append_transition(event).await {
                error!(position_id = %event.position_id, "Failed to append trade log: {}", e);
            }
        }
        if let Some(snapshot) = snapshot {
            if let Err(e) = store.save_snapshot(&snapshot).await {
                warn!("Failed to save ledger snapshot v{}: {}", snapshot.version, e);
            }
        }
    }
}

struct Quarantine {
    err: PilotError,
    event: Option<StateTransition>,
    snapshot: Option<LedgerSnapshot>,
}
