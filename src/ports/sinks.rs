use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::model::{Pair, PairId};
use crate::signal::Signal;

/// Where signals go once the state machine emits them.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn publish(&self, signal: &Signal) -> Result<()>;
}

/// Persistence for pair validation records.
#[async_trait]
pub trait PairStore: Send + Sync {
    async fn save_pair(&self, pair: &Pair) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSignalSink;

#[async_trait]
impl SignalSink for LogSignalSink {
    async fn publish(&self, signal: &Signal) -> Result<()> {
        log::info!("[SIGNAL] {}", signal.format_message());
        Ok(())
    }
}

/// Append-only JSONL log of pair records. The latest record per pair wins.
#[derive(Debug)]
pub struct JsonlPairStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPairStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the log into the current set of stored pairs.
    pub fn load(&self) -> Result<HashMap<PairId, Pair>> {
        let mut pairs = HashMap::new();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pairs),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to open {}", self.path.display()))
            }
        };
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let pair: Pair = serde_json::from_str(&line).with_context(|| {
                format!("bad record on line {} of {}", lineno + 1, self.path.display())
            })?;
            pairs.insert(pair.id(), pair);
        }
        Ok(pairs)
    }

    async fn append(&self, pair: &Pair) -> Result<()> {
        let line = serde_json::to_string(pair)?;
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[async_trait]
impl PairStore for JsonlPairStore {
    async fn save_pair(&self, pair: &Pair) -> Result<()> {
        self.append(pair).await
    }
}
