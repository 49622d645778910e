use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::OrderSide;

/// Option right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PutCall {
    Call,
    Put,
}

impl PutCall {
    pub fn as_str(&self) -> &'static str {
        match self {
            PutCall::Call => "CALL",
            PutCall::Put => "PUT",
        }
    }
}

impl fmt::Display for PutCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract terms plus the market statistics the entry filters need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub put_call: PutCall,
    /// Broker symbol of the contract, when the source provides one
    #[serde(default)]
    pub contract_symbol: Option<String>,
    #[serde(default)]
    pub delta: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub open_interest: Option<u64>,
}

impl OptionContract {
    pub fn days_to_expiration(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }

    /// Contract terms only; statistics do not make two contracts different
    pub fn same_terms(&self, other: &OptionContract) -> bool {
        self.strike == other.strike && self.expiry == other.expiry && self.put_call == other.put_call
    }
}

/// What is being traded. Option terms exist only for the option kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Instrument {
    Equity,
    Option(OptionContract),
}

impl Instrument {
    pub fn is_option(&self) -> bool {
        matches!(self, Instrument::Option(_))
    }

    pub fn option(&self) -> Option<&OptionContract> {
        match self {
            Instrument::Option(contract) => Some(contract),
            Instrument::Equity => None,
        }
    }

    /// Units controlled by one quantity (100 shares per listed option contract)
    pub fn multiplier(&self) -> Decimal {
        match self {
            Instrument::Equity => Decimal::ONE,
            Instrument::Option(_) => Decimal::from(100),
        }
    }

    /// Whether two instruments on the same symbol are the same tradeable thing
    pub fn equivalent(&self, other: &Instrument) -> bool {
        match (self, other) {
            (Instrument::Equity, Instrument::Equity) => true,
            (Instrument::Option(a), Instrument::Option(b)) => a.same_terms(b),
            _ => false,
        }
    }
}

/// Key identifying an instrument on a symbol, used for quotes and duplicate checks
pub fn instrument_key(symbol: &str, instrument: &Instrument) -> String {
    match instrument {
        Instrument::Equity => symbol.to_string(),
        Instrument::Option(c) => format!("{} {} {} {}", symbol, c.expiry, c.strike, c.put_call),
    }
}

/// One proposed trade opportunity from an external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub symbol: String,
    pub instrument: Instrument,
    pub action: OrderSide,
    /// Explicit quantity proposed by the source, capped by risk sizing
    #[serde(default)]
    pub quantity: Option<u64>,
    /// Conviction in [0, 1]
    pub strength: Decimal,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub rationale: String,
    /// Price per unit at signal time (premium for options)
    #[serde(default)]
    pub reference_price: Option<Decimal>,
    /// Daily volume of the underlying stock
    #[serde(default)]
    pub market_volume: Option<u64>,
}

impl Signal {
    pub fn key(&self) -> String {
        instrument_key(&self.symbol, &self.instrument)
    }

    /// Client request id for the entry order; stable across redeliveries of the same signal
    pub fn entry_request_id(&self) -> String {
        format!("entry-{}", self.id)
    }
}
