use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Instrument, OptionContract};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// +1 for long entries, -1 for short entries
    pub fn direction_sign(&self) -> Decimal {
        match self {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Expires at the end of the session
    Day,
    /// Good Till Cancelled
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeInForce::Day => write!(f, "DAY"),
            TimeInForce::Gtc => write!(f, "GOOD_TILL_CANCEL"),
        }
    }
}

/// Order request (what we want to do)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Assigned by us; the broker dedupes resubmissions carrying the same id
    pub client_request_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub option_leg: Option<OptionContract>,
}

impl OrderRequest {
    pub fn new(
        client_request_id: impl Into<String>,
        symbol: impl Into<String>,
        instrument: &Instrument,
        side: OrderSide,
        quantity: u64,
    ) -> Self {
        Self {
            client_request_id: client_request_id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Day,
            option_leg: instrument.option().cloned(),
        }
    }

    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.order_type = OrderType::Limit;
        self.limit_price = Some(price);
        self
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }
}

/// Broker-side order status as reported by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerOrderStatus {
    /// Accepted and resting (includes partial fills)
    Working,
    Filled,
    Rejected,
    Cancelled,
}

impl BrokerOrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BrokerOrderStatus::Working)
    }
}

/// Broker acknowledgment of a placed order or a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: BrokerOrderStatus,
    pub fill_price: Option<Decimal>,
    pub filled_quantity: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Broker answer to a cancel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CancelAck {
    /// Order is no longer working; whatever filled before the cancel is reported
    Cancelled {
        filled_quantity: u64,
        fill_price: Option<Decimal>,
    },
    /// The order filled completely before the cancel landed
    AlreadyFilled { fill_price: Decimal, filled_quantity: u64 },
}

/// Terminal result of one logical order submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderOutcome {
    Filled {
        order_id: String,
        fill_price: Decimal,
        filled_quantity: u64,
    },
    Rejected {
        order_id: Option<String>,
        reason: String,
    },
    /// Timed out and the cancel was confirmed with nothing filled
    Cancelled { order_id: Option<String> },
}

impl OrderOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderOutcome::Filled { .. })
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            OrderOutcome::Filled { order_id, .. } => Some(order_id),
            OrderOutcome::Rejected { order_id, .. } | OrderOutcome::Cancelled { order_id } => {
                order_id.as_deref()
            }
        }
    }
}
