//! Ledger Store
//!
//! Durable home for the position ledger:
//! - `ledger.json`: latest versioned snapshot, replaced atomically (write + rename)
//! - `ledger.json.corrupt`: copy of a snapshot that failed to parse
//! - `trade_log.jsonl`: append-only state transitions
//! - `alert_log.jsonl`: append-only alerts

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::{Position, StateTransition};
use crate::error::{PilotError, Result};
use crate::strategy::risk::RiskState;
use crate::supervisor::Alert;

const SNAPSHOT_FILE: &str = "ledger.json";
const TRADE_LOG_FILE: &str = "trade_log.jsonl";
const ALERT_LOG_FILE: &str = "alert_log.jsonl";

/// Point-in-time copy of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Monotonic; older snapshots never overwrite newer ones
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub risk: RiskState,
    /// Live positions plus finished ones still inside the retention window
    pub positions: Vec<Position>,
    /// Entry request ids of positions already dropped from `positions`
    #[serde(default)]
    pub retired_requests: Vec<String>,
}

/// Persistence collaborator for the ledger and its logs
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a snapshot; returns false when a newer version is already stored
    async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<bool>;

    async fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>>;

    async fn append_transition(&self, event: &StateTransition) -> Result<()>;

    async fn append_alert(&self, alert: &Alert) -> Result<()>;
}

/// JSON files under one data directory
pub struct JsonFileStore {
    data_dir: PathBuf,
    /// Highest snapshot version written so far
    written_version: Mutex<Option<u64>>,
    /// Set when `ledger.json` exists but cannot be parsed; saves are refused until it loads
    unreadable: AtomicBool,
    log_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, creating the data directory if needed
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).await?;
        info!("Ledger store at {}", data_dir.display());

        Ok(Self {
            data_dir,
            written_version: Mutex::new(None),
            unreadable: AtomicBool::new(false),
            log_lock: Mutex::new(()),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILE)
    }

    pub fn corrupt_copy_path(&self) -> PathBuf {
        self.snapshot_path().with_extension("json.corrupt")
    }

    pub fn trade_log_path(&self) -> PathBuf {
        self.data_dir.join(TRADE_LOG_FILE)
    }

    pub fn alert_log_path(&self) -> PathBuf {
        self.data_dir.join(ALERT_LOG_FILE)
    }

    async fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.log_lock.lock().await;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.data_dir.join(file))
            .await?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        Ok(())
    }

    /// Read every transition recorded in the trade log
    pub async fn read_trade_log(&self) -> Result<Vec<StateTransition>> {
        let path = self.trade_log_path();
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path).await?;
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(PilotError::from))
            .collect()
    }
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<bool> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(PilotError::Persistence(format!(
                "refusing to overwrite unreadable {}",
                self.snapshot_path().display()
            )));
        }

        let mut written = self.written_version.lock().await;
        if matches!(*written, Some(v) if v >= snapshot.version) {
            debug!(
                "Skipping stale ledger snapshot v{} (stored v{:?})",
                snapshot.version, *written
            );
            return Ok(false);
        }

        let body = serde_json::to_vec_pretty(snapshot)?;
        let target = self.snapshot_path();
        let tmp = target.with_extension("json.tmp");

        fs::write(&tmp, &body).await?;
        fs::rename(&tmp, &target).await.map_err(|e| {
            PilotError::Persistence(format!(
                "failed to replace {}: {}",
                target.display(),
                e
            ))
        })?;

        *written = Some(snapshot.version);
        debug!(
            "Saved ledger snapshot v{} ({} positions)",
            snapshot.version,
            snapshot.positions.len()
        );
        Ok(true)
    }

    async fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let path = self.snapshot_path();
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }

        let body = fs::read(&path).await?;
        let snapshot: LedgerSnapshot = match serde_json::from_slice(&body) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.unreadable.store(true, Ordering::SeqCst);
                let copy = self.corrupt_copy_path();
                match fs::copy(&path, &copy).await {
                    Ok(_) => error!("Unreadable ledger snapshot, copy kept at {}", copy.display()),
                    Err(copy_err) => warn!(
                        "Unreadable ledger snapshot, could not copy it to {}: {}",
                        copy.display(),
                        copy_err
                    ),
                }
                return Err(PilotError::Persistence(format!(
                    "corrupt snapshot {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        *self.written_version.lock().await = Some(snapshot.version);
        self.unreadable.store(false, Ordering::SeqCst);
        Ok(Some(snapshot))
    }

    async fn append_transition(&self, event: &StateTransition) -> Result<()> {
        self.append_line(TRADE_LOG_FILE, event).await
    }

    async fn append_alert(&self, alert: &Alert) -> Result<()> {
        self.append_line(ALERT_LOG_FILE, alert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Instrument, OrderSide, PositionStatus, Signal, TransitionReason};
    use crate::supervisor::AlertLevel;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn position() -> Position {
        let signal = Signal {
            id: Uuid::new_v4(),
            symbol: "NVDA".to_string(),
            instrument: Instrument::Equity,
            action: OrderSide::Buy,
            quantity: None,
            strength: dec!(0.5),
            source: "custom_scanner".to_string(),
            timestamp: Utc::now(),
            rationale: String::new(),
            reference_price: Some(dec!(120)),
            market_volume: Some(5_000_000),
        };
        Position::pending(&signal, 20, dec!(120), dec!(2400), chrono::Duration::minutes(30))
    }

    fn snapshot(version: u64, positions: Vec<Position>) -> LedgerSnapshot {
        LedgerSnapshot {
            version,
            saved_at: Utc::now(),
            risk: RiskState::new(dec!(100000)),
            positions,
            retired_requests: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_and_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();

        assert!(store.load_snapshot().await.unwrap().is_none());

        assert!(store.save_snapshot(&snapshot(2, vec![position()])).await.unwrap());
        assert!(!store.save_snapshot(&snapshot(1, vec![])).await.unwrap());

        let loaded = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].status, PositionStatus::PendingEntry);
        assert!(!store.snapshot_path().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let damaged = r#"{"version": 41, "positions": [ {"truncated": "#;
        std::fs::write(store.snapshot_path(), damaged).unwrap();

        let err = store.load_snapshot().await.unwrap_err();
        assert!(matches!(err, PilotError::Persistence(_)));
        assert_eq!(
            std::fs::read_to_string(store.corrupt_copy_path()).unwrap(),
            damaged
        );

        assert!(store.save_snapshot(&snapshot(1, vec![position()])).await.is_err());
        assert_eq!(
            std::fs::read_to_string(store.snapshot_path()).unwrap(),
            damaged
        );
    }

    #[tokio::test]
    async fn test_trade_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let pos = position();

        store
            .append_transition(&StateTransition::new(
                &pos,
                PositionStatus::PendingEntry,
                PositionStatus::Open,
                TransitionReason::EntryFilled,
            ))
            .await
            .unwrap();
        store
            .append_transition(&StateTransition::new(
                &pos,
                PositionStatus::Open,
                PositionStatus::PendingExit,
                TransitionReason::ExitTriggered(crate::domain::ExitReason::TakeProfit),
            ))
            .await
            .unwrap();
        store
            .append_alert(&Alert::new(AlertLevel::Info, "ledger", "Entry", "NVDA"))
            .await
            .unwrap();

        let log = store.read_trade_log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].to, PositionStatus::PendingExit);
        assert!(store.alert_log_path().exists());
    }
}
