use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PilotError, Result};
use crate::exchange::PriceFeed;

/// In-memory quotes keyed by instrument key, updated by whoever owns market data
#[derive(Debug, Default, Clone)]
pub struct StaticPriceFeed {
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
}

impl StaticPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, key: impl Into<String>, price: Decimal) {
        self.prices.write().await.insert(key.into(), price);
    }

    pub async fn remove(&self, key: &str) {
        self.prices.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.prices.read().await.len()
    }
}

#[async_trait]
impl PriceFeed for StaticPriceFeed {
    async fn quote(&self, key: &str) -> Result<Decimal> {
        self.prices
            .read()
            .await
            .get(key)
            .copied()
            .ok_or_else(|| PilotError::QuoteUnavailable(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_quote_lookup() {
        let feed = StaticPriceFeed::new();
        assert!(matches!(
            feed.quote("AAPL").await,
            Err(PilotError::QuoteUnavailable(_))
        ));

        feed.set_price("AAPL", dec!(201.5)).await;
        assert_eq!(feed.quote("AAPL").await.unwrap(), dec!(201.5));
        assert_eq!(feed.len().await, 1);
    }
}
