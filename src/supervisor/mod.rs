//! Supervisor Layer
//!
//! Alert routing for trading events and failures.

pub mod alert_manager;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertSink};
