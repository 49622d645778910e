//! Signal sources
//!
//! Push (`ChannelSignalSource`) and pull (`JsonlSignalSource`) providers of
//! the signal stream. Both may yield duplicates or out-of-order records; the
//! ledger and gate deal with that.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::Signal;
use crate::error::Result;
use crate::exchange::SignalSource;

use super::StaticPriceFeed;

/// Signals pushed through a tokio channel
pub struct ChannelSignalSource {
    rx: mpsc::Receiver<Signal>,
    closed: bool,
}

impl ChannelSignalSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx, closed: false })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn poll(&mut self) -> Result<Vec<Signal>> {
        let mut batch = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(signal) => batch.push(signal),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !self.closed {
                        debug!("Signal channel closed by all senders");
                    }
                    self.closed = true;
                    break;
                }
            }
        }
        Ok(batch)
    }
}

/// Tails a JSON-lines file, one signal per line
pub struct JsonlSignalSource {
    path: PathBuf,
    offset: u64,
}

impl JsonlSignalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[async_trait]
impl SignalSource for JsonlSignalSource {
    async fn poll(&mut self) -> Result<Vec<Signal>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            warn!(
                "Signal file {} shrank, reading from the start",
                self.path.display()
            );
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // Only consume complete lines; a partial trailing line is read next time
        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        let mut signals = Vec::new();
        for line in String::from_utf8_lossy(complete).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Signal>(line) {
                Ok(signal) => signals.push(signal),
                Err(e) => warn!("Skipping malformed signal line: {} ({})", e, line),
            }
        }
        Ok(signals)
    }
}

/// Wraps a source and records each signal's reference price in a quote table
pub struct PriceRecordingSource<S> {
    inner: S,
    quotes: Arc<StaticPriceFeed>,
}

impl<S: SignalSource> PriceRecordingSource<S> {
    pub fn new(inner: S, quotes: Arc<StaticPriceFeed>) -> Self {
        Self { inner, quotes }
    }
}

#[async_trait]
impl<S: SignalSource> SignalSource for PriceRecordingSource<S> {
    async fn poll(&mut self) -> Result<Vec<Signal>> {
        let signals = self.inner.poll().await?;
        for signal in &signals {
            if let Some(price) = signal.reference_price {
                self.quotes.set_price(signal.key(), price).await;
            }
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use uuid::Uuid;

    fn signal_json(symbol: &str) -> String {
        serde_json::json!({
            "id": Uuid::new_v4(),
            "symbol": symbol,
            "instrument": {"kind": "equity"},
            "action": "BUY",
            "strength": "0.6",
            "source": "custom_scanner",
            "timestamp": Utc::now(),
            "reference_price": "101.5",
            "market_volume": 2500000
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_channel_source_drains_available_signals() {
        let (tx, mut source) = ChannelSignalSource::new(8);
        for symbol in ["AAPL", "MSFT"] {
            let signal: Signal = serde_json::from_str(&signal_json(symbol)).unwrap();
            tx.send(signal).await.unwrap();
        }

        assert_eq!(source.poll().await.unwrap().len(), 2);
        assert!(source.poll().await.unwrap().is_empty());

        drop(tx);
        assert!(source.poll().await.unwrap().is_empty());
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_jsonl_source_tails_complete_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", signal_json("AAPL")).unwrap();
        writeln!(file, "not json").unwrap();
        write!(file, "{}", signal_json("TSLA")).unwrap();
        file.flush().unwrap();

        let mut source = JsonlSignalSource::new(file.path());
        let first = source.poll().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].symbol, "AAPL");
        assert_eq!(first[0].reference_price, Some(dec!(101.5)));

        // Finish the partial line
        writeln!(file).unwrap();
        file.flush().unwrap();
        let second = source.poll().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].symbol, "TSLA");

        assert!(source.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recording_source_updates_quotes() {
        use crate::exchange::PriceFeed;

        let (tx, source) = ChannelSignalSource::new(4);
        let quotes = Arc::new(StaticPriceFeed::new());
        let mut source = PriceRecordingSource::new(source, Arc::clone(&quotes));

        let signal: Signal = serde_json::from_str(&signal_json("NVDA")).unwrap();
        tx.send(signal).await.unwrap();

        assert_eq!(source.poll().await.unwrap().len(), 1);
        assert_eq!(quotes.quote("NVDA").await.unwrap(), dec!(101.5));
    }

    #[tokio::test]
    async fn test_missing_file_yields_nothing() {
        let mut source = JsonlSignalSource::new("/nonexistent/signals.jsonl");
        assert!(source.poll().await.unwrap().is_empty());
        assert_eq!(source.offset(), 0);
    }
}
