pub mod factory;
mod traits;

pub use factory::{broker_kind, build_broker_client};
#[cfg(test)]
pub use traits::MockPriceFeed;
pub use traits::{parse_broker_kind, BrokerClient, BrokerKind, PriceFeed, SignalSource};
