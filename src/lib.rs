pub mod adapters;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod supervisor;

pub use adapters::{
    ChannelSignalSource, JsonlSignalSource, PaperBroker, RestBroker, StaticPriceFeed,
    WebhookAlertSink,
};
pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownConfig, ShutdownSignal};
pub use error::{BrokerError, GateRejection, PilotError, Result, RiskRejection};
pub use exchange::{BrokerClient, PriceFeed, SignalSource};
pub use persistence::{JsonFileStore, LedgerSnapshot, LedgerStore};
pub use strategy::{ExecutionEngine, ExitMonitor, OrderSubmitter, PositionLedger, SignalOutcome};
pub use supervisor::{Alert, AlertLevel, AlertManager, AlertSink};
