use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::coordination::ShutdownError;
use crate::domain::PositionStatus;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum PilotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Signal intake errors
    #[error("Validation failed: {0}")]
    Validation(#[from] GateRejection),

    #[error("Risk limit exceeded: {0}")]
    RiskLimitExceeded(#[from] RiskRejection),

    // Broker errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker rejected order: {0}")]
    BrokerRejection(String),

    #[error("Order timeout: {0}")]
    OrderTimeout(String),

    #[error(
        "Reconciliation required for request {client_request_id} (order {order_id:?}): {detail}"
    )]
    ReconciliationRequired {
        client_request_id: String,
        order_id: Option<String>,
        detail: String,
    },

    // Ledger errors
    #[error("Invalid state transition for position {position_id}: from {from} to {to}")]
    InvalidStateTransition {
        position_id: Uuid,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("Position not found: {0}")]
    PositionNotFound(Uuid),

    #[error("Quote unavailable for {0}")]
    QuoteUnavailable(String),

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PilotError {
    /// Whether the error leaves broker-side state unknown
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, PilotError::ReconciliationRequired { .. })
    }
}

/// Result type alias for PilotError
pub type Result<T> = std::result::Result<T, PilotError>;

/// Reasons the signal gate refuses a signal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    #[error("symbol {symbol} is not on the watchlist")]
    NotInWatchlist { symbol: String },

    #[error("signal source {source_id} is disabled")]
    SourceDisabled { source_id: String },

    #[error("signal strength {strength} outside [0, 1]")]
    InvalidStrength { strength: Decimal },

    #[error("signal is {age_secs}s old (max {max_secs}s)")]
    StaleSignal { age_secs: i64, max_secs: u64 },

    #[error("market session is closed")]
    MarketClosed,

    #[error("stock trading is disabled")]
    EquityTradingDisabled,

    #[error("stock price {price} outside [{min}, {max}]")]
    PriceOutOfRange {
        price: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("volume {volume} below minimum {min}")]
    VolumeTooLow { volume: u64, min: u64 },

    #[error("contract type {contract_type} is not enabled")]
    ContractTypeDisabled { contract_type: String },

    #[error("option delta {delta} outside [{min}, {max}]")]
    DeltaOutOfRange {
        delta: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("{days} days to expiration outside [{min}, {max}]")]
    ExpirationOutOfRange { days: i64, min: i64, max: i64 },

    #[error("open interest {open_interest} below minimum {min}")]
    OpenInterestTooLow { open_interest: u64, min: u64 },

    #[error("missing market data: {field}")]
    MissingMarketData { field: &'static str },

    #[error("an equivalent position already exists for {instrument}")]
    DuplicatePosition { instrument: String },

    #[error("signal {signal_id} was already processed")]
    DuplicateSignal { signal_id: Uuid },
}

/// Reasons the risk sizer refuses a trade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RiskRejection {
    #[error("open positions {open} >= max {max}")]
    MaxOpenPositions { open: u32, max: u32 },

    #[error("daily risk budget exhausted: used ${used}, requested ${requested}, budget ${budget}")]
    DailyBudgetExhausted {
        used: Decimal,
        requested: Decimal,
        budget: Decimal,
    },

    #[error("position size ${requested} exceeds account balance ${balance}")]
    ExceedsBalance { requested: Decimal, balance: Decimal },

    #[error("position size ${amount} buys less than one unit at ${unit_cost}")]
    BelowMinimumSize { amount: Decimal, unit_cost: Decimal },
}

/// Errors reported by a broker collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Communication failure; the request may be retried with the same client request id
    #[error("transport failure: {0}")]
    Transport(String),

    /// Business-level refusal; never retried
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

impl From<BrokerError> for PilotError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Transport(detail) => PilotError::Transport(detail),
            BrokerError::Rejected(detail) => PilotError::BrokerRejection(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_broker_error_mapping() {
        let err: PilotError = BrokerError::Transport("reset".to_string()).into();
        assert!(matches!(err, PilotError::Transport(_)));

        let err: PilotError = BrokerError::Rejected("buying power".to_string()).into();
        assert!(matches!(err, PilotError::BrokerRejection(_)));
    }

    #[test]
    fn test_rejections_convert_to_taxonomy() {
        let err: PilotError = GateRejection::NotInWatchlist {
            symbol: "XYZ".to_string(),
        }
        .into();
        assert!(matches!(
            err,
            PilotError::Validation(GateRejection::NotInWatchlist { .. })
        ));

        let err: PilotError = RiskRejection::MaxOpenPositions { open: 5, max: 5 }.into();
        assert!(matches!(err, PilotError::RiskLimitExceeded(_)));
        assert!(err.to_string().contains("5 >= max 5"));

        let err: PilotError = RiskRejection::ExceedsBalance {
            requested: dec!(10),
            balance: dec!(5),
        }
        .into();
        assert!(!err.requires_reconciliation());
    }
}
