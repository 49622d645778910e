use std::sync::Arc;

use crate::adapters::{PaperBroker, RestBroker, StaticPriceFeed};
use crate::config::AppConfig;
use crate::error::{PilotError, Result};

use super::{BrokerClient, BrokerKind};

/// Broker kind implied by `account.paper_trading`
pub fn broker_kind(app_config: &AppConfig) -> BrokerKind {
    if app_config.account.paper_trading {
        BrokerKind::Paper
    } else {
        BrokerKind::Rest
    }
}

/// Create the runtime broker client from `AppConfig`.
///
/// The paper broker marks fills against `quotes` so paper positions see the
/// same prices the exit monitor does.
pub fn build_broker_client(
    app_config: &AppConfig,
    quotes: Arc<StaticPriceFeed>,
) -> Result<Arc<dyn BrokerClient>> {
    match broker_kind(app_config) {
        BrokerKind::Paper => Ok(Arc::new(PaperBroker::new(quotes))),
        BrokerKind::Rest => {
            let broker = &app_config.broker;
            let missing = |field: &str| {
                PilotError::Internal(format!("broker.{} is required for live trading", field))
            };
            let rest_url = broker.rest_url.as_deref().ok_or_else(|| missing("rest_url"))?;
            let account_id = broker
                .account_id
                .as_deref()
                .ok_or_else(|| missing("account_id"))?;
            let api_key = broker.api_key.clone().ok_or_else(|| missing("api_key"))?;

            let client = RestBroker::new(rest_url, account_id, api_key)?;
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_flag_selects_paper_broker() {
        let config = AppConfig::default_config(true);
        let broker = build_broker_client(&config, Arc::new(StaticPriceFeed::new())).unwrap();
        assert_eq!(broker.kind(), BrokerKind::Paper);
    }

    #[test]
    fn test_live_requires_credentials() {
        let config = AppConfig::default_config(false);
        let result = build_broker_client(&config, Arc::new(StaticPriceFeed::new()));
        assert!(result.is_err());
    }
}
