//! Alert Manager
//!
//! Routes trading alerts to the log, the alert log and any configured sinks.
//! Includes rate limiting to prevent alert storms. Delivery is best-effort:
//! sinks run on spawned tasks with a timeout and never fail the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::AlertConfig;
use crate::domain::{ExitReason, Position};
use crate::error::Result;
use crate::persistence::LedgerStore;

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational
    Info,
    /// Degraded but recovered locally
    Warning,
    /// Order failed terminally
    Error,
    /// Manual intervention required
    Critical,
}

impl AlertLevel {
    /// Get emoji prefix for alert level
    pub fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Info => "\u{2139}\u{fe0f}",    // info icon
            AlertLevel::Warning => "\u{26a0}\u{fe0f}", // warning icon
            AlertLevel::Error => "\u{274c}",           // red X
            AlertLevel::Critical => "\u{1f6a8}",       // police light
        }
    }

    /// Get severity string
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create a new alert
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add metadata to the alert
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Format for a chat message
    pub fn format_text(&self) -> String {
        format!(
            "{} **{}**\n\n**Component:** {}\n**Time:** {}\n\n{}",
            self.level.emoji(),
            self.title,
            self.component,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.message
        )
    }
}

/// One-way notification channel
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: DateTime<Utc>,
    suppressed_count: u32,
}

/// Alert Manager for coordinating notifications
pub struct AlertManager {
    config: AlertConfig,
    sinks: Vec<Arc<dyn AlertSink>>,
    store: Option<Arc<dyn LedgerStore>>,
    rate_limits: Arc<RwLock<HashMap<String, RateLimitState>>>,
    alerts_this_minute: Arc<RwLock<Vec<DateTime<Utc>>>>,
    event_tx: tokio::sync::broadcast::Sender<Alert>,
}

impl AlertManager {
    /// Create a new alert manager
    pub fn new(config: AlertConfig) -> Self {
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            config,
            sinks: Vec::new(),
            store: None,
            rate_limits: Arc::new(RwLock::new(HashMap::new())),
            alerts_this_minute: Arc::new(RwLock::new(Vec::new())),
            event_tx,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(AlertConfig::default())
    }

    /// Add a delivery sink
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Set store for the alert log
    pub fn with_store(mut self, store: Arc<dyn LedgerStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Subscribe to alerts
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Generate rate limit key for an alert
    fn rate_limit_key(alert: &Alert) -> String {
        format!("{}:{}:{}", alert.component, alert.level, alert.title)
    }

    /// Check if alert should be rate limited
    async fn should_rate_limit(&self, alert: &Alert) -> bool {
        let key = Self::rate_limit_key(alert);
        let now = Utc::now();

        let mut limits = self.rate_limits.write().await;

        if let Some(state) = limits.get_mut(&key) {
            let elapsed = now.signed_duration_since(state.last_sent).num_seconds().max(0) as u64;
            if elapsed < self.config.rate_limit_secs {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    alert.title, state.suppressed_count
                );
                return true;
            }

            // Reset state
            state.last_sent = now;
            state.suppressed_count = 0;
        } else {
            limits.insert(
                key,
                RateLimitState {
                    last_sent: now,
                    suppressed_count: 0,
                },
            );
        }

        false
    }

    /// Check global rate limit (alerts per minute)
    async fn is_throttled(&self) -> bool {
        let now = Utc::now();
        let minute_ago = now - chrono::Duration::minutes(1);

        let mut alerts = self.alerts_this_minute.write().await;

        // Clean old entries
        alerts.retain(|t| *t > minute_ago);

        if alerts.len() >= self.config.max_alerts_per_minute as usize {
            warn!(
                "Alert throttling: {} alerts in last minute (max: {})",
                alerts.len(),
                self.config.max_alerts_per_minute
            );
            return true;
        }

        alerts.push(now);
        false
    }

    /// Send an alert
    pub async fn alert(&self, alert: Alert) {
        // Always broadcast locally
        let _ = self.event_tx.send(alert.clone());

        // Log based on level
        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error => {
                error!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Critical => {
                error!(
                    "CRITICAL [{}] {}: {}",
                    alert.component, alert.title, alert.message
                )
            }
        }

        // Persist to the alert log
        if let Some(ref store) = self.store {
            if let Err(e) = store.append_alert(&alert).await {
                error!("Failed to persist alert: {}", e);
            }
        }

        if !self.config.enabled || self.sinks.is_empty() {
            return;
        }

        // Critical alerts bypass the per-key limit but not the global throttle
        if alert.level < AlertLevel::Critical && self.should_rate_limit(&alert).await {
            return;
        }

        if self.is_throttled().await {
            return;
        }

        let delivery_timeout = Duration::from_millis(self.config.delivery_timeout_ms);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let alert = alert.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(delivery_timeout, sink.deliver(&alert)).await {
                    Ok(Ok(())) => debug!("Alert '{}' delivered via {}", alert.title, sink.name()),
                    Ok(Err(e)) => error!("Failed to deliver alert via {}: {}", sink.name(), e),
                    Err(_) => error!(
                        "Alert delivery via {} timed out after {:?}",
                        sink.name(),
                        delivery_timeout
                    ),
                }
            });
        }
    }

    /// Send an info alert
    pub async fn info(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Info, component, title, message))
            .await;
    }

    /// Send a warning alert
    pub async fn warning(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Warning, component, title, message))
            .await;
    }

    /// Send an error alert
    pub async fn error(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Error, component, title, message))
            .await;
    }

    /// Send a critical alert
    pub async fn critical(&self, component: &str, title: &str, message: &str) {
        self.alert(Alert::new(AlertLevel::Critical, component, title, message))
            .await;
    }

    /// Entry order filled
    pub async fn position_opened(&self, position: &Position) {
        self.alert(
            Alert::new(
                AlertLevel::Info,
                "execution",
                "New Entry",
                &format!(
                    "{} {} x{} @ {}",
                    position.side,
                    position.key(),
                    position.quantity,
                    position.entry_price
                ),
            )
            .with_metadata(serde_json::json!({
                "position_id": position.id,
                "client_request_id": position.client_request_id,
                "order_id": position.entry_order_id,
            })),
        )
        .await;
    }

    /// Exit trigger fired
    pub async fn exit_triggered(&self, position: &Position, reason: ExitReason, price: rust_decimal::Decimal) {
        self.alert(
            Alert::new(
                AlertLevel::Info,
                "exit_monitor",
                "Exit Triggered",
                &format!(
                    "{} {} at {} (entry {}, high-water {})",
                    reason,
                    position.key(),
                    price,
                    position.entry_price,
                    position.high_water
                ),
            )
            .with_metadata(serde_json::json!({
                "position_id": position.id,
                "reason": reason,
            })),
        )
        .await;
    }

    /// Position closed with realized P&L
    pub async fn position_closed(&self, position: &Position) {
        self.alert(
            Alert::new(
                AlertLevel::Info,
                "exit_monitor",
                "Position Closed",
                &format!(
                    "{} closed @ {:?}, P&L {:?} ({:?})",
                    position.key(),
                    position.exit_price,
                    position.realized_pnl,
                    position.exit_reason
                ),
            )
            .with_metadata(serde_json::json!({
                "position_id": position.id,
                "realized_pnl": position.realized_pnl,
                "realized_cash_pnl": position.realized_cash_pnl,
            })),
        )
        .await;
    }

    /// Broker refused an order
    pub async fn order_rejected(&self, component: &str, position: &Position, reason: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                component,
                "Order Rejected",
                &format!("{}: {}", position.key(), reason),
            )
            .with_metadata(serde_json::json!({
                "position_id": position.id,
                "reason": reason,
            })),
        )
        .await;
    }

    /// Cancel-and-confirm failed; broker state unknown
    pub async fn reconciliation_required(&self, position: &Position, detail: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "execution",
                "Reconciliation Required",
                &format!(
                    "{} position {} is FAILED with unknown broker state: {}",
                    position.key(),
                    position.id,
                    detail
                ),
            )
            .with_metadata(serde_json::json!({
                "action": "manual_intervention_required",
                "position_id": position.id,
                "client_request_id": position.client_request_id,
            })),
        )
        .await;
    }

    /// Internal invariant violation
    pub async fn defect(&self, component: &str, detail: &str) {
        self.alert(
            Alert::new(AlertLevel::Critical, component, "Ledger Defect", detail).with_metadata(
                serde_json::json!({
                    "action": "position_quarantined",
                }),
            ),
        )
        .await;
    }

    /// Get suppressed alert counts
    pub async fn get_suppressed_counts(&self) -> HashMap<String, u32> {
        let limits = self.rate_limits.read().await;
        limits
            .iter()
            .filter(|(_, state)| state.suppressed_count > 0)
            .map(|(key, state)| (key.clone(), state.suppressed_count))
            .collect()
    }

    /// Reset rate limits (call daily)
    pub async fn reset_rate_limits(&self) {
        let mut limits = self.rate_limits.write().await;
        limits.clear();
        debug!("Alert rate limits reset");
    }
}
