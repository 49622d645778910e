//! Collaborator implementations: brokers, quotes, signal sources, alert delivery

pub mod paper_broker;
pub mod price_feed;
pub mod rest_broker;
pub mod signal_sources;
pub mod webhook;

pub use paper_broker::PaperBroker;
pub use price_feed::StaticPriceFeed;
pub use rest_broker::RestBroker;
pub use signal_sources::{ChannelSignalSource, JsonlSignalSource, PriceRecordingSource};
pub use webhook::WebhookAlertSink;
