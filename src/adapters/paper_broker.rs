//! Paper broker
//!
//! Dry-run order handling against the shared quote feed. Market orders fill at
//! the quote; limit orders fill at the quote once marketable (or at the limit
//! when no quote exists) and otherwise rest until cancelled.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{
    instrument_key, BrokerOrderStatus, CancelAck, Instrument, OrderAck, OrderRequest, OrderSide,
    OrderType,
};
use crate::error::BrokerError;
use crate::exchange::{BrokerClient, BrokerKind, PriceFeed};

use super::StaticPriceFeed;

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    ack: OrderAck,
}

pub struct PaperBroker {
    quotes: Arc<StaticPriceFeed>,
    /// client_request_id -> order
    orders: DashMap<String, PaperOrder>,
    /// broker order id -> client_request_id
    ids: DashMap<String, String>,
    next_id: AtomicU64,
}

impl PaperBroker {
    pub fn new(quotes: Arc<StaticPriceFeed>) -> Self {
        info!("Paper trading: orders are simulated against local quotes");
        Self {
            quotes,
            orders: DashMap::new(),
            ids: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of distinct orders accepted
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    async fn quote_for(&self, request: &OrderRequest) -> Option<Decimal> {
        let instrument = match &request.option_leg {
            Some(leg) => Instrument::Option(leg.clone()),
            None => Instrument::Equity,
        };
        self.quotes
            .quote(&instrument_key(&request.symbol, &instrument))
            .await
            .ok()
    }

    /// Fill price if the order can execute now
    fn execution_price(request: &OrderRequest, quote: Option<Decimal>) -> Option<Decimal> {
        match (request.order_type, request.limit_price, quote) {
            (OrderType::Market, _, quote) => quote,
            (OrderType::Limit, Some(limit), None) => Some(limit),
            (OrderType::Limit, Some(limit), Some(quote)) => {
                let marketable = match request.side {
                    OrderSide::Buy => limit >= quote,
                    OrderSide::Sell => limit <= quote,
                };
                marketable.then_some(quote)
            }
            (OrderType::Limit, None, _) => None,
        }
    }

    fn filled(ack: &mut OrderAck, price: Decimal, quantity: u64) {
        ack.status = BrokerOrderStatus::Filled;
        ack.fill_price = Some(price);
        ack.filled_quantity = quantity;
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Paper
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BrokerError> {
        if let Some(existing) = self.orders.get(&request.client_request_id) {
            debug!(
                client_request_id = %request.client_request_id,
                "Duplicate paper order, returning original"
            );
            return Ok(existing.ack.clone());
        }

        if request.quantity == 0 {
            return Err(BrokerError::Rejected("quantity must be positive".to_string()));
        }
        if request.order_type == OrderType::Limit && request.limit_price.is_none() {
            return Err(BrokerError::Rejected("limit order without a price".to_string()));
        }

        let quote = self.quote_for(request).await;
        if request.order_type == OrderType::Market && quote.is_none() {
            return Err(BrokerError::Rejected(format!(
                "no quote for {} market order",
                request.symbol
            )));
        }

        let order_id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut ack = OrderAck {
            order_id: order_id.clone(),
            status: BrokerOrderStatus::Working,
            fill_price: None,
            filled_quantity: 0,
            detail: None,
        };
        if let Some(price) = Self::execution_price(request, quote) {
            Self::filled(&mut ack, price, request.quantity);
        }

        info!(
            client_request_id = %request.client_request_id,
            "[PAPER] {} {} x{} {} -> {:?} @ {:?}",
            request.side,
            request.symbol,
            request.quantity,
            request.order_type,
            ack.status,
            ack.fill_price
        );

        self.ids
            .insert(order_id, request.client_request_id.clone());
        self.orders.insert(
            request.client_request_id.clone(),
            PaperOrder {
                request: request.clone(),
                ack: ack.clone(),
            },
        );
        Ok(ack)
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderAck, BrokerError> {
        let client_id = self
            .ids
            .get(order_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| BrokerError::Rejected(format!("unknown order {}", order_id)))?;

        let (request, ack) = match self.orders.get(&client_id) {
            Some(order) => (order.request.clone(), order.ack.clone()),
            None => return Err(BrokerError::Rejected(format!("unknown order {}", order_id))),
        };
        if ack.status.is_terminal() {
            return Ok(ack);
        }

        // Resting limit order: re-check against the latest quote
        let quote = self.quote_for(&request).await;
        let Some(price) = quote.and_then(|q| Self::execution_price(&request, Some(q))) else {
            return Ok(ack);
        };

        let mut ack = ack;
        Self::filled(&mut ack, price, request.quantity);
        if let Some(mut order) = self.orders.get_mut(&client_id) {
            order.ack = ack.clone();
        }
        Ok(ack)
    }

    async fn cancel_order(
        &self,
        client_request_id: &str,
        order_id: Option<&str>,
    ) -> Result<CancelAck, BrokerError> {
        let client_id = order_id
            .and_then(|id| self.ids.get(id).map(|r| r.value().clone()))
            .unwrap_or_else(|| client_request_id.to_string());

        let Some(mut order) = self.orders.get_mut(&client_id) else {
            // Never reached the book
            return Ok(CancelAck::Cancelled {
                filled_quantity: 0,
                fill_price: None,
            });
        };

        match order.ack.status {
            BrokerOrderStatus::Filled => Ok(CancelAck::AlreadyFilled {
                fill_price: order.ack.fill_price.unwrap_or_default(),
                filled_quantity: order.ack.filled_quantity,
            }),
            _ => {
                order.ack.status = BrokerOrderStatus::Cancelled;
                Ok(CancelAck::Cancelled {
                    filled_quantity: order.ack.filled_quantity,
                    fill_price: order.ack.fill_price,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn broker_with_quote(price: Decimal) -> PaperBroker {
        let quotes = Arc::new(StaticPriceFeed::new());
        quotes.set_price("MSFT", price).await;
        PaperBroker::new(quotes)
    }

    fn buy(id: &str, limit: Decimal) -> OrderRequest {
        OrderRequest::new(id, "MSFT", &Instrument::Equity, OrderSide::Buy, 5).with_limit(limit)
    }

    #[tokio::test]
    async fn test_marketable_limit_fills_at_quote() {
        let broker = broker_with_quote(dec!(400)).await;
        let ack = broker.place_order(&buy("entry-1", dec!(402))).await.unwrap();

        assert_eq!(ack.status, BrokerOrderStatus::Filled);
        assert_eq!(ack.fill_price, Some(dec!(400)));
        assert_eq!(ack.filled_quantity, 5);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_returns_original() {
        let broker = broker_with_quote(dec!(400)).await;
        let first = broker.place_order(&buy("entry-1", dec!(402))).await.unwrap();
        let second = broker.place_order(&buy("entry-1", dec!(402))).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(broker.order_count(), 1);
    }

    #[tokio::test]
    async fn test_resting_limit_can_be_cancelled() {
        let broker = broker_with_quote(dec!(400)).await;
        let ack = broker.place_order(&buy("entry-2", dec!(390))).await.unwrap();
        assert_eq!(ack.status, BrokerOrderStatus::Working);

        let status = broker.order_status(&ack.order_id).await.unwrap();
        assert_eq!(status.status, BrokerOrderStatus::Working);

        let cancel = broker
            .cancel_order("entry-2", Some(&ack.order_id))
            .await
            .unwrap();
        assert_eq!(
            cancel,
            CancelAck::Cancelled {
                filled_quantity: 0,
                fill_price: None
            }
        );
    }

    #[tokio::test]
    async fn test_market_order_without_quote_is_rejected() {
        let broker = PaperBroker::new(Arc::new(StaticPriceFeed::new()));
        let request = OrderRequest::new("exit-1", "AAPL", &Instrument::Equity, OrderSide::Sell, 1);

        assert!(matches!(
            broker.place_order(&request).await,
            Err(BrokerError::Rejected(_))
        ));
    }
}
