use chrono::{Duration, NaiveTime};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::domain::{OrderType, PutCall, TimeInForce};

/// Upper bound for second-valued windows (one year)
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;
/// Upper bound for `exit.max_hold_time_minutes` (one year)
pub const MAX_HOLD_MINUTES: i64 = 365 * 24 * 60;

/// Seconds as a chrono duration, clamped to `MAX_WINDOW_SECS`
pub fn capped_seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub account: AccountConfig,
    pub risk: RiskConfig,
    pub entry: EntryConfig,
    pub exit: ExitConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub watchlist: Vec<String>,
    /// One symbol per line; replaces `watchlist` when the file exists
    #[serde(default)]
    pub watchlist_file: Option<PathBuf>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Account balance used for position sizing (USD)
    pub balance: Decimal,
    /// Route orders to the paper broker instead of the live REST broker
    #[serde(default = "default_true")]
    pub paper_trading: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum number of concurrent live positions
    pub max_open_positions: u32,
    /// Maximum position size in USD
    pub max_position_size: Decimal,
    /// Daily risk budget as a percent of the account (5 = 5%)
    pub max_portfolio_risk_percent: Decimal,
}

impl RiskConfig {
    /// balance x max_portfolio_risk_percent
    pub fn daily_budget(&self, balance: Decimal) -> Decimal {
        balance * self.max_portfolio_risk_percent / Decimal::from(100)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    pub options: OptionEntryConfig,
    pub stocks: StockEntryConfig,
    /// Signal sources allowed to open positions (empty = all)
    #[serde(default)]
    pub enabled_sources: Vec<String>,
    /// How long a symbol stays "already positioned" after a reservation, in seconds
    #[serde(default)]
    pub duplicate_window_secs: u64,
    /// Signals older than this are dropped (0 = no limit)
    #[serde(default)]
    pub max_signal_age_secs: u64,
    #[serde(default)]
    pub market_hours: MarketHoursConfig,
}

impl EntryConfig {
    pub fn duplicate_window(&self) -> Duration {
        capped_seconds(self.duplicate_window_secs)
    }

    pub fn source_enabled(&self, source: &str) -> bool {
        self.enabled_sources.is_empty() || self.enabled_sources.iter().any(|s| s == source)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionEntryConfig {
    pub min_delta: Decimal,
    pub max_delta: Decimal,
    pub min_volume: u64,
    pub min_open_interest: u64,
    pub days_to_expiration_min: i64,
    pub days_to_expiration_max: i64,
    #[serde(default = "default_contract_types")]
    pub contract_types: Vec<PutCall>,
}

fn default_contract_types() -> Vec<PutCall> {
    vec![PutCall::Call, PutCall::Put]
}

#[derive(Debug, Clone, Deserialize)]
pub struct StockEntryConfig {
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub min_volume: u64,
    #[serde(default = "default_true")]
    pub enable: bool,
}

/// Trading session window at a fixed UTC offset
#[derive(Debug, Clone, Deserialize)]
pub struct MarketHoursConfig {
    /// Reject signals outside the session
    #[serde(default)]
    pub enforce: bool,
    #[serde(default = "default_market_open")]
    pub open: NaiveTime,
    #[serde(default = "default_market_close")]
    pub close: NaiveTime,
    /// Minutes east of UTC for the exchange clock (-300 = US Eastern standard time)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub pre_market_enable: bool,
    #[serde(default)]
    pub after_hours_enable: bool,
}

fn default_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
}

fn default_market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default()
}

fn default_utc_offset_minutes() -> i32 {
    -300
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            enforce: false,
            open: default_market_open(),
            close: default_market_close(),
            utc_offset_minutes: default_utc_offset_minutes(),
            pre_market_enable: false,
            after_hours_enable: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Close at this percent gain (50 = +50%)
    pub take_profit_percent: Decimal,
    /// Close at this percent loss (20 = -20%)
    pub stop_loss_percent: Decimal,
    pub max_hold_time_minutes: i64,
    /// Distance from the high-water mark, in percent
    pub trailing_stop_percent: Decimal,
    #[serde(default)]
    pub use_market_orders: bool,
    /// Limit price offset from the reference price, in percent
    #[serde(default)]
    pub limit_order_offset_percent: Decimal,
}

impl ExitConfig {
    pub fn max_hold(&self) -> Duration {
        Duration::minutes(self.max_hold_time_minutes.clamp(0, MAX_HOLD_MINUTES))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    #[serde(default = "default_time_in_force")]
    pub time_in_force: TimeInForce,
    /// Hard deadline for one logical order submission in milliseconds
    #[serde(default = "default_order_timeout")]
    pub order_timeout_ms: u64,
    /// Retries after a transport failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
    /// First backoff delay; doubles per attempt
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Polling interval for order status in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Deadline for the cancel-and-confirm sequence
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_ms: u64,
    /// Entry submissions allowed in flight at once
    #[serde(default = "default_max_concurrent_submissions")]
    pub max_concurrent_submissions: usize,
}

fn default_order_type() -> OrderType {
    OrderType::Limit
}

fn default_time_in_force() -> TimeInForce {
    TimeInForce::Day
}

fn default_order_timeout() -> u64 {
    60_000
}

fn default_max_retries() -> u8 {
    3
}

fn default_retry_base_delay() -> u64 {
    200
}

fn default_poll_interval() -> u64 {
    500
}

fn default_cancel_timeout() -> u64 {
    10_000
}

fn default_max_concurrent_submissions() -> usize {
    4
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_type: default_order_type(),
            time_in_force: default_time_in_force(),
            order_timeout_ms: default_order_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            poll_interval_ms: default_poll_interval(),
            cancel_timeout_ms: default_cancel_timeout(),
            max_concurrent_submissions: default_max_concurrent_submissions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Signal source polling interval in milliseconds
    #[serde(default = "default_signal_interval")]
    pub check_signals_interval_ms: u64,
    /// Exit monitor pass interval in milliseconds
    #[serde(default = "default_exit_interval")]
    pub exit_poll_interval_ms: u64,
    /// Upper bound on draining in-flight orders during shutdown, in seconds
    #[serde(default = "default_drain_timeout")]
    pub shutdown_drain_timeout_secs: u64,
}

fn default_signal_interval() -> u64 {
    30_000
}

fn default_exit_interval() -> u64 {
    5_000
}

fn default_drain_timeout() -> u64 {
    120
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            check_signals_interval_ms: default_signal_interval(),
            exit_poll_interval_ms: default_exit_interval(),
            shutdown_drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerConfig {
    /// REST endpoint for order routing
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    /// Bearer token; usually supplied as TRADEPILOT__BROKER__API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Chat webhook receiving alert text
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Minimum interval between duplicate alerts
    #[serde(default = "default_rate_limit")]
    pub rate_limit_secs: u64,
    #[serde(default = "default_max_alerts_per_minute")]
    pub max_alerts_per_minute: u32,
    /// Upper bound on one sink delivery
    #[serde(default = "default_delivery_timeout")]
    pub delivery_timeout_ms: u64,
}

fn default_rate_limit() -> u64 {
    60
}

fn default_max_alerts_per_minute() -> u32 {
    10
}

fn default_delivery_timeout() -> u64 {
    5_000
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            rate_limit_secs: default_rate_limit(),
            max_alerts_per_minute: default_max_alerts_per_minute(),
            delivery_timeout_ms: default_delivery_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the ledger snapshot and the trade log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// CLOSED/FAILED positions stay in the ledger this long after finishing;
    /// raised to the duplicate window and the signal age limit when those are longer
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,
    /// Minimum gap between snapshots written only because a high-water mark moved
    #[serde(default = "default_high_water_save_interval_secs")]
    pub high_water_save_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_terminal_retention_secs() -> u64 {
    86_400
}

fn default_high_water_save_interval_secs() -> u64 {
    30
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            terminal_retention_secs: default_terminal_retention_secs(),
            high_water_save_interval_secs: default_high_water_save_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.order_timeout_ms", 60_000)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TRADEPILOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TRADEPILOT__RISK__MAX_OPEN_POSITIONS, etc.)
            .add_source(
                Environment::with_prefix("TRADEPILOT")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.watchlist = config.resolve_watchlist();
        Ok(config)
    }

    /// Watchlist from `watchlist_file` when readable, otherwise the inline list; upper-cased
    pub fn resolve_watchlist(&self) -> Vec<String> {
        if let Some(path) = &self.watchlist_file {
            if path.exists() {
                match std::fs::read_to_string(path) {
                    Ok(contents) => return parse_watchlist(&contents),
                    Err(e) => warn!("Error loading watchlist from {}: {}", path.display(), e),
                }
            }
        }
        self.watchlist.iter().map(|s| s.trim().to_uppercase()).collect()
    }

    pub fn watchlist_set(&self) -> HashSet<String> {
        self.watchlist.iter().cloned().collect()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(paper_trading: bool) -> Self {
        use rust_decimal_macros::dec;

        Self {
            account: AccountConfig {
                balance: dec!(100000),
                paper_trading,
            },
            risk: RiskConfig {
                max_open_positions: 5,
                max_position_size: dec!(10000),
                max_portfolio_risk_percent: dec!(5),
            },
            entry: EntryConfig {
                options: OptionEntryConfig {
                    min_delta: dec!(0.15),
                    max_delta: dec!(0.85),
                    min_volume: 100,
                    min_open_interest: 50,
                    days_to_expiration_min: 7,
                    days_to_expiration_max: 60,
                    contract_types: default_contract_types(),
                },
                stocks: StockEntryConfig {
                    min_price: dec!(5),
                    max_price: dec!(1000),
                    min_volume: 1_000_000,
                    enable: true,
                },
                enabled_sources: vec![
                    "benzinga_news".to_string(),
                    "benzinga_options_flow".to_string(),
                    "custom_scanner".to_string(),
                    "technical_indicators".to_string(),
                ],
                duplicate_window_secs: 0,
                max_signal_age_secs: 300,
                market_hours: MarketHoursConfig::default(),
            },
            exit: ExitConfig {
                take_profit_percent: dec!(50),
                stop_loss_percent: dec!(20),
                max_hold_time_minutes: 480,
                trailing_stop_percent: dec!(15),
                use_market_orders: false,
                limit_order_offset_percent: dec!(0.5),
            },
            execution: ExecutionConfig::default(),
            schedule: ScheduleConfig::default(),
            watchlist: [
                "AAPL", "MSFT", "TSLA", "NVDA", "AMZN", "GOOGL", "META", "AMD", "INTC", "NFLX",
                "PYPL", "SQ", "COIN", "RIOT", "MARA",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            watchlist_file: None,
            broker: BrokerConfig::default(),
            alerts: AlertConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let hundred = Decimal::from(100);

        if self.account.balance <= Decimal::ZERO {
            errors.push("account.balance must be positive".to_string());
        }

        // Validate risk params
        if self.risk.max_open_positions == 0 {
            errors.push("risk.max_open_positions must be at least 1".to_string());
        }
        if self.risk.max_position_size <= Decimal::ZERO {
            errors.push("risk.max_position_size must be positive".to_string());
        }
        if self.risk.max_portfolio_risk_percent <= Decimal::ZERO
            || self.risk.max_portfolio_risk_percent > hundred
        {
            errors.push("risk.max_portfolio_risk_percent must be in (0, 100]".to_string());
        }

        // Validate entry filters
        let options = &self.entry.options;
        if options.min_delta > options.max_delta {
            errors.push("entry.options.min_delta must not exceed max_delta".to_string());
        }
        if options.days_to_expiration_min > options.days_to_expiration_max {
            errors.push(
                "entry.options.days_to_expiration_min must not exceed days_to_expiration_max"
                    .to_string(),
            );
        }
        if self.entry.stocks.min_price > self.entry.stocks.max_price {
            errors.push("entry.stocks.min_price must not exceed max_price".to_string());
        }
        if self.entry.market_hours.open >= self.entry.market_hours.close {
            errors.push("entry.market_hours.open must be before close".to_string());
        }

        for (name, secs) in [
            ("entry.duplicate_window_secs", self.entry.duplicate_window_secs),
            ("entry.max_signal_age_secs", self.entry.max_signal_age_secs),
            ("persistence.terminal_retention_secs", self.persistence.terminal_retention_secs),
            (
                "persistence.high_water_save_interval_secs",
                self.persistence.high_water_save_interval_secs,
            ),
        ] {
            if secs > MAX_WINDOW_SECS {
                errors.push(format!("{} must be at most {}", name, MAX_WINDOW_SECS));
            }
        }

        // Validate exit thresholds
        if self.exit.take_profit_percent <= Decimal::ZERO {
            errors.push("exit.take_profit_percent must be positive".to_string());
        }
        if self.exit.stop_loss_percent <= Decimal::ZERO || self.exit.stop_loss_percent >= hundred {
            errors.push("exit.stop_loss_percent must be in (0, 100)".to_string());
        }
        if self.exit.trailing_stop_percent < Decimal::ZERO
            || self.exit.trailing_stop_percent >= hundred
        {
            errors.push("exit.trailing_stop_percent must be in [0, 100)".to_string());
        }
        if self.exit.max_hold_time_minutes <= 0 || self.exit.max_hold_time_minutes > MAX_HOLD_MINUTES {
            errors.push(format!(
                "exit.max_hold_time_minutes must be in [1, {}]",
                MAX_HOLD_MINUTES
            ));
        }

        // Validate execution
        if self.execution.order_timeout_ms == 0 {
            errors.push("execution.order_timeout_ms must be positive".to_string());
        }
        if self.execution.poll_interval_ms == 0 {
            errors.push("execution.poll_interval_ms must be positive".to_string());
        }
        if self.execution.max_concurrent_submissions == 0 {
            errors.push("execution.max_concurrent_submissions must be at least 1".to_string());
        }

        if self.watchlist.is_empty() {
            errors.push("watchlist is empty".to_string());
        }

        if !self.account.paper_trading
            && (self.broker.rest_url.is_none()
                || self.broker.account_id.is_none()
                || self.broker.api_key.is_none())
        {
            errors.push(
                "live trading requires broker.rest_url, broker.account_id and broker.api_key"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_watchlist(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_uppercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config(true);
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.order_timeout_ms, 60_000);
        assert_eq!(config.risk.daily_budget(config.account.balance), dec!(5000));
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default_config(false);
        config.risk.max_open_positions = 0;
        config.entry.options.min_delta = dec!(0.9);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("max_open_positions")));
        assert!(errors.iter().any(|e| e.contains("min_delta")));
        assert!(errors.iter().any(|e| e.contains("live trading")));
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = AppConfig::default_config(true);
        config.entry.duplicate_window_secs = u64::MAX;
        config.exit.max_hold_time_minutes = i64::MAX;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("duplicate_window_secs")));
        assert!(errors.iter().any(|e| e.contains("max_hold_time_minutes")));

        // Unvalidated values still convert without panicking
        assert_eq!(config.entry.duplicate_window(), Duration::days(365));
        assert_eq!(config.exit.max_hold(), Duration::days(365));
    }

    #[test]
    fn test_parse_watchlist_file() {
        let parsed = parse_watchlist("aapl\n\n  msft \n# comment\nnvda\n");
        assert_eq!(parsed, vec!["AAPL", "MSFT", "NVDA"]);
    }

    #[test]
    fn test_source_toggle() {
        let mut entry = AppConfig::default_config(true).entry;
        assert!(entry.source_enabled("benzinga_news"));
        assert!(!entry.source_enabled("discord_tip"));

        entry.enabled_sources.clear();
        assert!(entry.source_enabled("discord_tip"));
    }

    #[test]
    fn test_load_from_toml_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
watchlist = ["aapl", "msft"]

[account]
balance = 50000

[risk]
max_open_positions = 2
max_position_size = 2500
max_portfolio_risk_percent = 4

[entry.options]
min_delta = 0.2
max_delta = 0.8
min_volume = 10
min_open_interest = 5
days_to_expiration_min = 1
days_to_expiration_max = 30

[entry.stocks]
min_price = 1
max_price = 500
min_volume = 1000

[exit]
take_profit_percent = 40
stop_loss_percent = 10
max_hold_time_minutes = 60
trailing_stop_percent = 5
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.watchlist, vec!["AAPL", "MSFT"]);
        assert_eq!(config.risk.max_open_positions, 2);
        assert_eq!(config.account.balance, dec!(50000));
        assert!(config.account.paper_trading);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.entry.options.contract_types.len(), 2);
    }
}
