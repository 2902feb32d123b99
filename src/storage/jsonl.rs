// =============================================================================
// JSON-lines candle store - append-only file with an in-memory index
// =============================================================================
//
// One candle per line. The file is replayed into an ordered index on open;
// lines that fail to parse (e.g. a torn final write) are skipped with a
// warning. A write is acknowledged only after `sync_data`, and the index is
// updated only after the bytes are on disk.
//
// A failed append is truncated back off the file. If even that fails, the
// next record is preceded by a newline so it never merges with the fragment.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{validate, BatchReport, CandleIndex, CandleStore, InsertOutcome, StoreError};
use crate::types::Candle;

pub struct JsonlCandleStore {
    path: PathBuf,
    index: RwLock<CandleIndex>,
    /// Serializes appends so the duplicate check and the write are atomic.
    writer: Mutex<Writer>,
}

struct Writer {
    file: File,
    /// The file ends in a partial record with no trailing newline.
    torn: bool,
}

impl Writer {
    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let start = self.file.metadata().await?.len();
        let guard: &[u8] = if self.torn { b"\n" } else { b"" };

        match write_synced(&mut self.file, guard, bytes).await {
            Ok(()) => {
                self.torn = false;
                Ok(())
            }
            Err(e) => {
                if let Err(trunc) = self.file.set_len(start).await {
                    warn!(error = %trunc, "failed to roll back partial candle write");
                    self.torn = true;
                }
                Err(e)
            }
        }
    }
}

async fn write_synced(file: &mut File, guard: &[u8], bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(guard).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

impl JsonlCandleStore {
    /// Open (or create) the store at `path`, replaying existing records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut index = CandleIndex::default();
        let mut skipped = 0usize;
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Candle>(line) {
                Ok(candle) if candle.is_consistent() => {
                    index.insert(candle);
                }
                Ok(_) => {
                    skipped += 1;
                    warn!(line = lineno + 1, "skipping inconsistent candle record");
                }
                Err(e) => {
                    skipped += 1;
                    warn!(line = lineno + 1, error = %e, "skipping unreadable candle record");
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let torn = !content.is_empty() && !content.ends_with('\n');

        info!(
            path = %path.display(),
            records = index.len(),
            skipped,
            "candle store opened"
        );

        Ok(Self {
            path,
            index: RwLock::new(index),
            writer: Mutex::new(Writer { file, torn }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

#[async_trait]
impl CandleStore for JsonlCandleStore {
    async fn insert_one(&self, candle: &Candle) -> Result<InsertOutcome, StoreError> {
        validate(candle)?;
        let mut line = serde_json::to_string(candle)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if self.index.read().contains(candle) {
            return Ok(InsertOutcome::Duplicate);
        }
        writer.append(line.as_bytes()).await?;
        self.index.write().insert(candle.clone());
        Ok(InsertOutcome::Inserted)
    }

    /// Appends every new row of the batch with a single write and sync.
    async fn insert_many(&self, candles: &[Candle]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut failures = Vec::new();
        let mut pending: Vec<&Candle> = Vec::new();
        let mut buf = String::new();

        let mut writer = self.writer.lock().await;
        {
            let index = self.index.read();
            let mut seen: HashSet<(&str, i64)> = HashSet::new();
            for candle in candles {
                if let Err(e) = validate(candle) {
                    failures.push(e);
                    continue;
                }
                if index.contains(candle)
                    || !seen.insert((candle.symbol.as_str(), candle.bucket_start))
                {
                    report.duplicates += 1;
                    continue;
                }
                match serde_json::to_string(candle) {
                    Ok(line) => {
                        buf.push_str(&line);
                        buf.push('\n');
                        pending.push(candle);
                    }
                    Err(e) => failures.push(e.into()),
                }
            }
        }

        if !pending.is_empty() {
            match writer.append(buf.as_bytes()).await {
                Ok(()) => {
                    let mut index = self.index.write();
                    for candle in &pending {
                        index.insert((*candle).clone());
                    }
                    report.inserted += pending.len();
                }
                Err(e) => {
                    warn!(rows = pending.len(), error = %e, "batch append failed");
                    failures.push(StoreError::Io(e));
                }
            }
        }
        drop(writer);

        debug!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            failed = failures.len(),
            "batch insert finished"
        );

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(StoreError::Batch { report, failures })
        }
    }

    async fn find_earliest(&self, symbol: &str, since: i64) -> Result<Option<Candle>, StoreError> {
        Ok(self.index.read().earliest(symbol, since))
    }

    async fn find_range(&self, symbol: &str, since: i64) -> Result<Vec<Candle>, StoreError> {
        Ok(self.index.read().range(symbol, since))
    }

    async fn find_latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        Ok(self.index.read().latest(symbol, limit))
    }
}
