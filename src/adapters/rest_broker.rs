//! REST broker adapter (account orders API).
//!
//! Orders are posted as single-leg `orderLegCollection` payloads with bearer
//! auth. 201 means accepted, other 4xx are business rejections, 5xx and
//! network failures are transport errors the submitter may retry.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain::{BrokerOrderStatus, CancelAck, OrderAck, OrderRequest, OrderType};
use crate::error::{BrokerError, PilotError, Result};
use crate::exchange::{BrokerClient, BrokerKind};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct RestBroker {
    http: Client,
    base_url: String,
    account_id: String,
    api_key: String,
}

impl RestBroker {
    pub fn new(base_url: &str, account_id: &str, api_key: String) -> Result<Self> {
        let http = Client::builder()
            .user_agent("tradepilot/0.1")
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| PilotError::Internal(format!("failed to build broker HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_id: account_id.to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn orders_url(&self) -> String {
        format!("{}/accounts/{}/orders", self.base_url, self.account_id)
    }

    fn order_url(&self, order_id: &str) -> String {
        format!("{}/{}", self.orders_url(), order_id)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> std::result::Result<reqwest::Response, BrokerError> {
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(&self.api_key);

        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            req = req.header(CONTENT_TYPE, "application/json").json(body);
        }

        req.send()
            .await
            .map_err(|e| BrokerError::Transport(format!("request to {} failed: {}", url, e)))
    }

    async fn fetch_order(&self, order_id: &str) -> std::result::Result<Value, BrokerError> {
        let url = self.order_url(order_id);
        let resp = self.send(Method::GET, &url, None, None).await?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::Transport(format!("invalid order payload: {}", e)))
    }
}

/// Order body in the broker's single-leg format
pub fn order_payload(request: &OrderRequest) -> Value {
    let mut instrument = json!({
        "symbol": request.symbol,
        "assetType": if request.option_leg.is_some() { "OPTION" } else { "EQUITY" },
    });

    if let (Some(leg), Some(fields)) = (&request.option_leg, instrument.as_object_mut()) {
        if let Some(contract_symbol) = &leg.contract_symbol {
            fields.insert("symbol".to_string(), json!(contract_symbol));
        }
        fields.insert("underlyingSymbol".to_string(), json!(request.symbol));
        fields.insert("putCall".to_string(), json!(leg.put_call.as_str()));
        fields.insert(
            "expirationDate".to_string(),
            json!(leg.expiry.format("%Y-%m-%d").to_string()),
        );
        fields.insert("strikePrice".to_string(), json!(leg.strike.to_string()));
    }

    let mut payload = json!({
        "orderType": request.order_type.to_string(),
        "session": "NORMAL",
        "duration": request.time_in_force.to_string(),
        "orderStrategyType": "SINGLE",
        "orderLegCollection": [{
            "instruction": request.side.to_string(),
            "quantity": request.quantity,
            "instrument": instrument,
        }],
    });

    if let (OrderType::Limit, Some(price), Some(fields)) =
        (request.order_type, request.limit_price, payload.as_object_mut())
    {
        fields.insert("price".to_string(), json!(price.to_string()));
    }

    payload
}

/// 4xx (other than timeouts and throttling) is a business rejection; everything else is transport
pub fn classify_failure(status: StatusCode, body: &str) -> BrokerError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        BrokerError::Rejected(detail)
    } else {
        BrokerError::Transport(detail)
    }
}

fn decimal_field(value: &Value, key: &str) -> Option<Decimal> {
    match value.get(key)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

/// Average execution price across `orderActivityCollection[].executionLegs[]`
fn execution_price(order: &Value) -> Option<Decimal> {
    let mut notional = Decimal::ZERO;
    let mut quantity = Decimal::ZERO;

    for activity in order.get("orderActivityCollection")?.as_array()? {
        let Some(legs) = activity.get("executionLegs").and_then(Value::as_array) else {
            continue;
        };
        for leg in legs {
            if let (Some(price), Some(qty)) = (decimal_field(leg, "price"), decimal_field(leg, "quantity")) {
                notional += price * qty;
                quantity += qty;
            }
        }
    }

    if quantity.is_zero() {
        None
    } else {
        Some(notional / quantity)
    }
}

/// Normalize an order document into an `OrderAck`
pub fn parse_order_ack(order_id: &str, order: &Value) -> OrderAck {
    let raw_status = order
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("WORKING")
        .to_ascii_uppercase();

    let status = match raw_status.as_str() {
        "FILLED" => BrokerOrderStatus::Filled,
        "REJECTED" => BrokerOrderStatus::Rejected,
        "CANCELED" | "CANCELLED" | "EXPIRED" | "REPLACED" => BrokerOrderStatus::Cancelled,
        _ => BrokerOrderStatus::Working,
    };

    let filled_quantity = decimal_field(order, "filledQuantity")
        .and_then(|q| q.floor().to_u64())
        .unwrap_or(0);

    OrderAck {
        order_id: order_id.to_string(),
        status,
        fill_price: execution_price(order).or_else(|| decimal_field(order, "price")),
        filled_quantity,
        detail: order
            .get("statusDescription")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Order id from the `Location` header of a 201 response
fn order_id_from_location(location: Option<&HeaderValue>) -> Option<String> {
    let location = location?.to_str().ok()?;
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl BrokerClient for RestBroker {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Rest
    }

    async fn place_order(&self, request: &OrderRequest) -> std::result::Result<OrderAck, BrokerError> {
        let payload = order_payload(request);
        let url = self.orders_url();
        debug!(
            client_request_id = %request.client_request_id,
            "POST {} {}", url, payload
        );

        let resp = self
            .send(Method::POST, &url, Some(&payload), Some(&request.client_request_id))
            .await?;
        let status = resp.status();
        let location = resp.headers().get(LOCATION).cloned();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        if status != StatusCode::CREATED && !status.is_success() {
            return Err(classify_failure(status, &text));
        }

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let order_id = order_id_from_location(location.as_ref())
            .or_else(|| body.get("orderId").map(|v| v.to_string().trim_matches('"').to_string()))
            .ok_or_else(|| {
                BrokerError::Transport("order accepted without an order id".to_string())
            })?;

        if body.is_object() {
            Ok(parse_order_ack(&order_id, &body))
        } else {
            Ok(OrderAck {
                order_id,
                status: BrokerOrderStatus::Working,
                fill_price: None,
                filled_quantity: 0,
                detail: None,
            })
        }
    }

    async fn order_status(&self, order_id: &str) -> std::result::Result<OrderAck, BrokerError> {
        let order = self.fetch_order(order_id).await?;
        Ok(parse_order_ack(order_id, &order))
    }

    async fn cancel_order(
        &self,
        client_request_id: &str,
        order_id: Option<&str>,
    ) -> std::result::Result<CancelAck, BrokerError> {
        let Some(order_id) = order_id else {
            // No order id means the broker never acknowledged; it cannot be addressed by client id
            warn!(client_request_id, "Cannot cancel an order without a broker order id");
            return Err(BrokerError::Transport(format!(
                "no broker order id for request {}",
                client_request_id
            )));
        };

        let url = self.order_url(order_id);
        let resp = self.send(Method::DELETE, &url, None, None).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // A finished order refuses cancellation; its final state decides below
            if status.is_server_error() {
                return Err(classify_failure(status, &text));
            }
            debug!(order_id, "Cancel refused ({}), checking final state", status);
        }

        let ack = parse_order_ack(order_id, &self.fetch_order(order_id).await?);
        match ack.status {
            BrokerOrderStatus::Filled => Ok(CancelAck::AlreadyFilled {
                fill_price: ack.fill_price.ok_or_else(|| {
                    BrokerError::Transport(format!("order {} filled without a price", order_id))
                })?,
                filled_quantity: ack.filled_quantity,
            }),
            BrokerOrderStatus::Cancelled | BrokerOrderStatus::Rejected => Ok(CancelAck::Cancelled {
                filled_quantity: ack.filled_quantity,
                fill_price: ack.fill_price,
            }),
            BrokerOrderStatus::Working => Err(BrokerError::Transport(format!(
                "order {} still working after cancel",
                order_id
            ))),
        }
    }
}
