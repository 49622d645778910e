use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::{CancelAck, OrderAck, OrderRequest, Signal};
use crate::error::{BrokerError, PilotError, Result};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Paper,
    Rest,
}

impl Default for BrokerKind {
    fn default() -> Self {
        Self::Paper
    }
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Rest => "rest",
        }
    }
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "dry_run" => Ok(Self::Paper),
            "rest" | "live" => Ok(Self::Rest),
            _ => Err("invalid broker; expected paper|rest"),
        }
    }
}

pub fn parse_broker_kind(raw: &str) -> Result<BrokerKind> {
    BrokerKind::from_str(raw).map_err(|e| PilotError::Internal(e.to_string()))
}

/// Broker order API.
///
/// At-least-once requests, at-most-once fills: a request carrying a
/// `client_request_id` the broker has already seen must not create a second
/// order.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn kind(&self) -> BrokerKind;

    async fn place_order(&self, request: &OrderRequest) -> std::result::Result<OrderAck, BrokerError>;

    async fn order_status(&self, order_id: &str) -> std::result::Result<OrderAck, BrokerError>;

    /// Cancel by broker order id when known, otherwise by client request id
    async fn cancel_order(
        &self,
        client_request_id: &str,
        order_id: Option<&str>,
    ) -> std::result::Result<CancelAck, BrokerError>;
}

/// Current price per instrument key, used by the exit monitor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn quote(&self, key: &str) -> Result<Decimal>;
}

/// Lazy, unbounded sequence of signals; may contain gaps, duplicates and
/// out-of-order records.
#[async_trait]
pub trait SignalSource: Send {
    /// Signals available since the previous poll (possibly none)
    async fn poll(&mut self) -> Result<Vec<Signal>>;
}
