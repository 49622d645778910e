//! Order Submitter
//!
//! Places one order under its client request id, retrying transport failures
//! with backoff until the order deadline. A working order is polled until it
//! fills; at the deadline it is cancelled and the cancel confirmed. An
//! unconfirmed cancel resolves to reconciliation-required.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::domain::{BrokerOrderStatus, CancelAck, OrderAck, OrderOutcome, OrderRequest};
use crate::error::{BrokerError, PilotError, Result};
use crate::exchange::BrokerClient;

/// Drives one logical order from placement to a terminal outcome
pub struct OrderSubmitter {
    broker: Arc<dyn BrokerClient>,
    config: ExecutionConfig,
}

impl OrderSubmitter {
    pub fn new(broker: Arc<dyn BrokerClient>, config: ExecutionConfig) -> Self {
        Self { broker, config }
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    /// Submit an order and wait for fill, rejection or confirmed cancel.
    ///
    /// Transport failures are retried with exponential backoff using the same
    /// client request id. Once the order deadline passes the submitter cancels
    /// and confirms; a failed cancel returns `ReconciliationRequired`.
    pub async fn submit(&self, request: &OrderRequest) -> Result<OrderOutcome> {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(self.config.order_timeout_ms);

        let ack = match self.place_with_retry(request, deadline).await {
            Placement::Acked(ack) => ack,
            Placement::Rejected(reason) => {
                warn!(
                    client_request_id = %request.client_request_id,
                    "Order rejected by broker: {}", reason
                );
                return Ok(OrderOutcome::Rejected {
                    order_id: None,
                    reason,
                });
            }
            Placement::Unconfirmed(detail) => {
                warn!(
                    client_request_id = %request.client_request_id,
                    "Order placement unconfirmed ({}), attempting cancel", detail
                );
                return self.cancel_and_confirm(request, None).await;
            }
        };

        debug!(
            client_request_id = %request.client_request_id,
            order_id = %ack.order_id,
            "Order acknowledged: {:?}", ack.status
        );

        let order_id = ack.order_id.clone();
        let terminal = if ack.status.is_terminal() {
            Some(ack)
        } else {
            let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
            timeout_at(deadline, self.wait_for_fill(&ack.order_id, poll_interval))
                .await
                .ok()
        };

        match terminal {
            Some(ack) => {
                let outcome = self.resolve(request, ack)?;
                info!(
                    client_request_id = %request.client_request_id,
                    "Order {:?} resolved in {}ms",
                    outcome,
                    start.elapsed().as_millis()
                );
                Ok(outcome)
            }
            None => {
                warn!(
                    client_request_id = %request.client_request_id,
                    "Order timed out after {}ms, attempting cancel", self.config.order_timeout_ms
                );
                self.cancel_and_confirm(request, Some(&order_id)).await
            }
        }
    }

    /// Place the order, retrying transport failures until acked, rejected or out of budget
    async fn place_with_retry(&self, request: &OrderRequest, deadline: Instant) -> Placement {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let err = match timeout_at(deadline, self.broker.place_order(request)).await {
                Ok(Ok(ack)) => return Placement::Acked(ack),
                Ok(Err(BrokerError::Rejected(reason))) => return Placement::Rejected(reason),
                Ok(Err(err)) => err,
                Err(_) => return Placement::Unconfirmed("order deadline reached".to_string()),
            };

            if attempts > u32::from(self.config.max_retries) {
                error!(
                    client_request_id = %request.client_request_id,
                    "Order placement failed after {} attempts: {}", attempts, err
                );
                return Placement::Unconfirmed(format!(
                    "max retries exceeded after {} attempts: {}",
                    attempts, err
                ));
            }

            // Exponential backoff
            let delay = self.backoff(attempts);
            if Instant::now() + delay >= deadline {
                return Placement::Unconfirmed(format!("no time left to retry: {}", err));
            }

            warn!(
                client_request_id = %request.client_request_id,
                "Order attempt {} failed: {}. Retrying in {:?}", attempts, err, delay
            );
            sleep(delay).await;
        }
    }

    /// base x 2^(attempt-1), plus up to a quarter of base as jitter
    fn backoff(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        let base = self.config.retry_base_delay_ms;
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base.saturating_mul(factor).saturating_add(jitter))
    }

    /// Poll for order fill
    async fn wait_for_fill(&self, order_id: &str, poll_interval: Duration) -> OrderAck {
        loop {
            sleep(poll_interval).await;

            match self.broker.order_status(order_id).await {
                Ok(ack) if ack.status.is_terminal() => return ack,
                Ok(_) => {
                    // Still working, continue polling
                }
                Err(e) => {
                    debug!(order_id, "Order status poll failed: {}", e);
                }
            }
        }
    }

    /// Cancel and wait for the broker to confirm the order is no longer working
    async fn cancel_and_confirm(
        &self,
        request: &OrderRequest,
        order_id: Option<&str>,
    ) -> Result<OrderOutcome> {
        let cancel_timeout = Duration::from_millis(self.config.cancel_timeout_ms);
        let reconciliation = |detail: String| {
            error!(
                client_request_id = %request.client_request_id,
                order_id = ?order_id,
                "Cancel-and-confirm failed, manual reconciliation required: {}", detail
            );
            PilotError::ReconciliationRequired {
                client_request_id: request.client_request_id.clone(),
                order_id: order_id.map(str::to_string),
                detail,
            }
        };

        let ack = match timeout(
            cancel_timeout,
            self.broker.cancel_order(&request.client_request_id, order_id),
        )
        .await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => return Err(reconciliation(format!("cancel failed: {}", e))),
            Err(_) => {
                return Err(reconciliation(format!(
                    "cancel not confirmed within {}ms",
                    self.config.cancel_timeout_ms
                )))
            }
        };

        let order_id = order_id.map(str::to_string);
        match ack {
            CancelAck::AlreadyFilled {
                fill_price,
                filled_quantity,
            } => {
                info!(
                    client_request_id = %request.client_request_id,
                    "Order filled before cancel landed: {} @ {}", filled_quantity, fill_price
                );
                Ok(OrderOutcome::Filled {
                    order_id: order_id.unwrap_or_else(|| request.client_request_id.clone()),
                    fill_price,
                    filled_quantity,
                })
            }
            CancelAck::Cancelled {
                filled_quantity,
                fill_price,
            } if filled_quantity > 0 => {
                let fill_price = fill_price
                    .or(request.limit_price)
                    .ok_or_else(|| reconciliation("partial fill without a price".to_string()))?;
                warn!(
                    client_request_id = %request.client_request_id,
                    "Order cancelled after partial fill: {} of {} @ {}",
                    filled_quantity,
                    request.quantity,
                    fill_price
                );
                Ok(OrderOutcome::Filled {
                    order_id: order_id.unwrap_or_else(|| request.client_request_id.clone()),
                    fill_price,
                    filled_quantity,
                })
            }
            CancelAck::Cancelled { .. } => {
                info!(
                    client_request_id = %request.client_request_id,
                    "Order cancelled with nothing filled"
                );
                Ok(OrderOutcome::Cancelled { order_id })
            }
        }
    }

    /// Map a terminal broker ack onto an outcome
    fn resolve(&self, request: &OrderRequest, ack: OrderAck) -> Result<OrderOutcome> {
        let fill_price = |ack: &OrderAck| -> Result<Decimal> {
            ack.fill_price
                .or(request.limit_price)
                .ok_or_else(|| PilotError::ReconciliationRequired {
                    client_request_id: request.client_request_id.clone(),
                    order_id: Some(ack.order_id.clone()),
                    detail: "fill reported without a price".to_string(),
                })
        };

        match ack.status {
            BrokerOrderStatus::Filled => Ok(OrderOutcome::Filled {
                fill_price: fill_price(&ack)?,
                filled_quantity: if ack.filled_quantity > 0 {
                    ack.filled_quantity
                } else {
                    request.quantity
                },
                order_id: ack.order_id,
            }),
            BrokerOrderStatus::Cancelled if ack.filled_quantity > 0 => Ok(OrderOutcome::Filled {
                fill_price: fill_price(&ack)?,
                filled_quantity: ack.filled_quantity,
                order_id: ack.order_id,
            }),
            BrokerOrderStatus::Cancelled => Ok(OrderOutcome::Cancelled {
                order_id: Some(ack.order_id),
            }),
            BrokerOrderStatus::Rejected => Ok(OrderOutcome::Rejected {
                reason: ack
                    .detail
                    .unwrap_or_else(|| "rejected by broker".to_string()),
                order_id: Some(ack.order_id),
            }),
            BrokerOrderStatus::Working => Err(PilotError::Internal(format!(
                "order {} resolved while still working",
                ack.order_id
            ))),
        }
    }
}

enum Placement {
    Acked(OrderAck),
    Rejected(String),
    /// No acknowledgment; the order may or may not exist at the broker
    Unconfirmed(String),
}
