//! Strategy module
//!
//! The signal-to-position pipeline:
//! - `gate` - watchlist, source and entry-filter admission
//! - `risk` - position sizing against account and daily limits
//! - `ledger` - position table, risk counters and the state machine
//! - `executor` - order submission with retry, timeout and cancel-and-confirm
//! - `exit_monitor` - stop-loss, take-profit, trailing stop and max-hold exits
//! - `engine` - the execution loop tying them together

pub mod engine;
pub mod executor;
pub mod exit_monitor;
pub mod gate;
pub mod ledger;
pub mod risk;

pub use engine::{entry_limit_price, ExecutionEngine, SignalOutcome};
pub use executor::OrderSubmitter;
pub use exit_monitor::{closing_limit_price, ExitCheck, ExitMonitor};
pub use ledger::{Admission, PositionLedger, Retention};
pub use risk::RiskState;
