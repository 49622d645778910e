use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{instrument_key, Instrument, OrderSide, Signal};

pub type PositionId = Uuid;

/// Position lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Entry order in flight; risk already reserved
    PendingEntry,
    /// Entry filled, exit monitoring active
    Open,
    /// Closing order in flight
    PendingExit,
    Closed,
    /// Unrecoverable order error or quarantined defect
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::PendingEntry => "PENDING_ENTRY",
            PositionStatus::Open => "OPEN",
            PositionStatus::PendingExit => "PENDING_EXIT",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Failed => "FAILED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: PositionStatus) -> bool {
        use PositionStatus::*;

        match (self, target) {
            // From PendingEntry
            (PendingEntry, Open) => true,   // Entry filled
            (PendingEntry, Failed) => true, // Rejected, cancelled or unreconciled

            // From Open
            (Open, PendingExit) => true, // Exit trigger fired

            // From PendingExit
            (PendingExit, Closed) => true, // Closing order filled
            (PendingExit, Open) => true,   // Exit abandoned, monitoring resumes
            (PendingExit, Failed) => true, // Closing order unreconciled

            // Closed and Failed are absorbing
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<PositionStatus> {
        use PositionStatus::*;

        match self {
            PendingEntry => vec![Open, Failed],
            Open => vec![PendingExit],
            PendingExit => vec![Closed, Open, Failed],
            Closed | Failed => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Failed)
    }

    /// Counts against `max_open_positions`
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn has_pending_order(&self) -> bool {
        matches!(
            self,
            PositionStatus::PendingEntry | PositionStatus::PendingExit
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PositionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING_ENTRY" => Ok(PositionStatus::PendingEntry),
            "OPEN" => Ok(PositionStatus::Open),
            "PENDING_EXIT" => Ok(PositionStatus::PendingExit),
            "CLOSED" => Ok(PositionStatus::Closed),
            "FAILED" => Ok(PositionStatus::Failed),
            _ => Err(format!("Unknown position status: {}", s)),
        }
    }
}

/// Why an exit fired, in evaluation priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    MaxHoldTime,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::MaxHoldTime => "max_hold_time",
        };
        f.write_str(s)
    }
}

/// Cause attached to every ledger transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum TransitionReason {
    EntryFilled,
    EntryRejected(String),
    EntryCancelled,
    ExitTriggered(ExitReason),
    ExitFilled(ExitReason),
    ExitAbandoned(String),
    ReconciliationRequired(String),
    Quarantined(String),
    RestoredUnknown,
}

impl TransitionReason {
    /// Whether a failed entry gives its reserved risk back to the daily budget
    pub fn refunds_risk(&self) -> bool {
        matches!(
            self,
            TransitionReason::EntryRejected(_) | TransitionReason::EntryCancelled
        )
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionReason::EntryFilled => write!(f, "entry filled"),
            TransitionReason::EntryRejected(d) => write!(f, "entry rejected: {}", d),
            TransitionReason::EntryCancelled => write!(f, "entry cancelled after timeout"),
            TransitionReason::ExitTriggered(r) => write!(f, "exit triggered: {}", r),
            TransitionReason::ExitFilled(r) => write!(f, "exit filled: {}", r),
            TransitionReason::ExitAbandoned(d) => write!(f, "exit abandoned: {}", d),
            TransitionReason::ReconciliationRequired(d) => {
                write!(f, "reconciliation required: {}", d)
            }
            TransitionReason::Quarantined(d) => write!(f, "quarantined: {}", d),
            TransitionReason::RestoredUnknown => write!(f, "restored with unknown broker state"),
        }
    }
}

/// One open or closed trade resulting from an accepted signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub signal_id: Uuid,
    pub symbol: String,
    pub instrument: Instrument,
    /// Side of the entry order
    pub side: OrderSide,
    pub client_request_id: String,
    pub entry_order_id: Option<String>,
    /// Reference price at reservation, replaced by the fill price on open
    pub entry_price: Decimal,
    pub quantity: u64,
    /// Risk budget consumed by this position
    pub reserved_amount: Decimal,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub exit_order_id: Option<String>,
    pub exit_price: Option<Decimal>,
    /// (exit - entry) x quantity x direction, in quoted price units
    pub realized_pnl: Option<Decimal>,
    /// `realized_pnl` in account dollars (x100 per option contract)
    #[serde(default)]
    pub realized_cash_pnl: Option<Decimal>,
    /// Best price seen while open
    pub high_water: Decimal,
    /// Time-in-force deadline for the max-hold exit
    pub deadline: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub last_reason: Option<TransitionReason>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create the PENDING_ENTRY record for a reserved signal
    pub fn pending(
        signal: &Signal,
        quantity: u64,
        entry_price: Decimal,
        reserved_amount: Decimal,
        max_hold: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            instrument: signal.instrument.clone(),
            side: signal.action,
            client_request_id: signal.entry_request_id(),
            entry_order_id: None,
            entry_price,
            quantity,
            reserved_amount,
            opened_at: now,
            status: PositionStatus::PendingEntry,
            exit_reason: None,
            exit_order_id: None,
            exit_price: None,
            realized_pnl: None,
            realized_cash_pnl: None,
            high_water: entry_price,
            deadline: now + max_hold,
            closed_at: None,
            last_reason: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> String {
        instrument_key(&self.symbol, &self.instrument)
    }

    pub fn is_long(&self) -> bool {
        self.side == OrderSide::Buy
    }

    /// Move the high-water mark toward the favourable side; returns true when it moved
    pub fn update_high_water(&mut self, price: Decimal) -> bool {
        let improved = if self.is_long() {
            price > self.high_water
        } else {
            price < self.high_water
        };
        if improved {
            self.high_water = price;
            self.updated_at = Utc::now();
        }
        improved
    }

    /// (exit - entry) x quantity x direction for the whole position
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        self.pnl_for(exit_price, self.quantity)
    }

    /// P&L of closing `quantity` units at `exit_price`, in quoted price units
    pub fn pnl_for(&self, exit_price: Decimal, quantity: u64) -> Decimal {
        (exit_price - self.entry_price) * Decimal::from(quantity) * self.side.direction_sign()
    }

    /// Account dollars a P&L amount is worth for this instrument
    pub fn cash_value(&self, pnl: Decimal) -> Decimal {
        pnl * self.instrument.multiplier()
    }

    /// Signed percentage move from entry in the position's favour
    pub fn return_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price
            * Decimal::from(100)
            * self.side.direction_sign()
    }

    pub fn holding_duration_secs(&self) -> i64 {
        (Utc::now() - self.opened_at).num_seconds()
    }
}

/// State transition event (for the trade log)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub position_id: PositionId,
    pub symbol: String,
    pub from: PositionStatus,
    pub to: PositionStatus,
    pub reason: TransitionReason,
    pub timestamp: DateTime<Utc>,
}

impl StateTransition {
    pub fn new(
        position: &Position,
        from: PositionStatus,
        to: PositionStatus,
        reason: TransitionReason,
    ) -> Self {
        Self {
            position_id: position.id,
            symbol: position.symbol.clone(),
            from,
            to,
            reason,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal(action: OrderSide) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "TSLA".to_string(),
            instrument: Instrument::Equity,
            action,
            quantity: None,
            strength: dec!(1),
            source: "custom_scanner".to_string(),
            timestamp: Utc::now(),
            rationale: String::new(),
            reference_price: Some(dec!(100)),
            market_volume: None,
        }
    }

    #[test]
    fn test_valid_transitions() {
        use PositionStatus::*;

        assert!(PendingEntry.can_transition_to(Open));
        assert!(PendingEntry.can_transition_to(Failed));
        assert!(Open.can_transition_to(PendingExit));
        assert!(PendingExit.can_transition_to(Closed));
        assert!(PendingExit.can_transition_to(Open));
        assert!(PendingExit.can_transition_to(Failed));

        assert!(!PendingEntry.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Failed));
        assert!(!PendingEntry.can_transition_to(PendingExit));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        use PositionStatus::*;

        for terminal in [Closed, Failed] {
            for target in [PendingEntry, Open, PendingExit, Closed, Failed] {
                assert!(!terminal.can_transition_to(target));
            }
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    #[test]
    fn test_valid_transitions_agree_with_predicate() {
        use PositionStatus::*;
        let all = [PendingEntry, Open, PendingExit, Closed, Failed];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    from.valid_transitions().contains(&to)
                );
            }
        }
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!(
            PositionStatus::try_from("pending_exit").unwrap(),
            PositionStatus::PendingExit
        );
        assert!(PositionStatus::try_from("HALF_OPEN").is_err());
    }

    #[test]
    fn test_high_water_moves_only_favourably() {
        let mut long = Position::pending(&signal(OrderSide::Buy), 10, dec!(100), dec!(1000), Duration::minutes(5));
        assert!(long.update_high_water(dec!(110)));
        assert!(!long.update_high_water(dec!(105)));
        assert_eq!(long.high_water, dec!(110));

        let mut short = Position::pending(&signal(OrderSide::Sell), 10, dec!(100), dec!(1000), Duration::minutes(5));
        assert!(short.update_high_water(dec!(90)));
        assert!(!short.update_high_water(dec!(95)));
        assert_eq!(short.high_water, dec!(90));
    }

    #[test]
    fn test_pnl_respects_direction() {
        let long = Position::pending(&signal(OrderSide::Buy), 3, dec!(100), dec!(300), Duration::minutes(5));
        assert_eq!(long.pnl_at(dec!(150)), dec!(150));
        assert_eq!(long.return_pct(dec!(150)), dec!(50));

        let short = Position::pending(&signal(OrderSide::Sell), 3, dec!(100), dec!(300), Duration::minutes(5));
        assert_eq!(short.pnl_at(dec!(90)), dec!(30));
        assert_eq!(short.return_pct(dec!(120)), dec!(-20));
    }

    #[test]
    fn test_option_pnl_is_per_contract_price_with_separate_cash_value() {
        let mut sig = signal(OrderSide::Buy);
        sig.instrument = Instrument::Option(crate::domain::OptionContract {
            strike: dec!(200),
            expiry: Utc::now().date_naive() + Duration::days(30),
            put_call: crate::domain::PutCall::Call,
            contract_symbol: None,
            delta: Some(dec!(0.5)),
            volume: Some(500),
            open_interest: Some(200),
        });
        let position = Position::pending(&sig, 4, dec!(4), dec!(1600), Duration::minutes(5));

        let pnl = position.pnl_at(dec!(3));
        assert_eq!(pnl, dec!(-4));
        assert_eq!(position.cash_value(pnl), dec!(-400));
    }

    #[test]
    fn test_refund_policy() {
        assert!(TransitionReason::EntryCancelled.refunds_risk());
        assert!(TransitionReason::EntryRejected("x".into()).refunds_risk());
        assert!(!TransitionReason::ReconciliationRequired("x".into()).refunds_risk());
    }
}
