//! Usage recording
//!
//! Every finished task, fatal failures included, produces one
//! [`UsageRecord`]. Recorders are pluggable; the JSON lines log doubles as the
//! source of persisted totals for seeding the budget ledger at startup.

use crate::error::Result;
use crate::outcome::OutcomeStatus;
use crate::task::TaskType;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub tokens_used: u64,
    /// Cost in USD
    pub cost: f64,
    pub latency_ms: u64,
    pub status: OutcomeStatus,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub records: usize,
    /// Tokens recorded on the accounting day
    pub daily_tokens: u64,
    pub lifetime_tokens: u64,
    pub cost: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord, today: NaiveDate) {
        self.records += 1;
        self.lifetime_tokens += record.tokens_used;
        if record.recorded_at.date_naive() == today {
            self.daily_tokens += record.tokens_used;
        }
        self.cost += record.cost;
    }
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record_usage(&self, record: UsageRecord) -> Result<()>;
}

/// Recorder keeping everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryUsageLog {
    records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }

    /// Totals with the current UTC day as the accounting day.
    pub fn totals(&self) -> UsageTotals {
        let today = Utc::now().date_naive();
        let mut totals = UsageTotals::default();
        for record in self.records.lock().iter() {
            totals.add(record, today);
        }
        totals
    }
}

#[async_trait]
impl UsageRecorder for InMemoryUsageLog {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Append-only JSON lines file.
#[derive(Debug)]
pub struct JsonlUsageLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlUsageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back. A missing file reads as empty; lines that
    /// fail to parse are skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<UsageRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<UsageRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping malformed usage record"
                ),
            }
        }
        Ok(records)
    }

    /// Totals for seeding the budget ledger, with `today` as the accounting day.
    pub async fn load_totals(&self, today: NaiveDate) -> Result<UsageTotals> {
        let mut totals = UsageTotals::default();
        for record in self.read_all().await? {
            totals.add(&record, today);
        }
        debug!(
            path = %self.path.display(),
            records = totals.records,
            daily_tokens = totals.daily_tokens,
            lifetime_tokens = totals.lifetime_tokens,
            "Loaded usage totals"
        );
        Ok(totals)
    }
}

#[async_trait]
impl UsageRecorder for JsonlUsageLog {
    async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
