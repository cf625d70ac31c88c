use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

/// Progress records untouched for longer than this are removed by the reaper.
pub const PROGRESS_TTL_SECONDS: i64 = 1800;
pub const REAPER_INTERVAL_SECONDS: u64 = 300;
const SYNTHETIC_PROGRESS_CAP: f64 = 95.0;

/// Per-job download progress, keyed by the requested URL.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressRecord {
    pub progress: f64,
    #[serde(skip_serializing)]
    pub timestamp: DateTime<Utc>,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta: u64,
}

impl ProgressRecord {
    pub fn reset(now: DateTime<Utc>) -> Self {
        Self {
            progress: 0.0,
            timestamp: now,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            eta: 0,
        }
    }
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self::reset(Utc::now())
    }
}

/// Percent shown to pollers. When the collaborator reports no total size,
/// advance a synthetic counter that stops short of signalling completion.
pub fn compute_percent(downloaded_bytes: u64, total_bytes: u64, previous: f64) -> f64 {
    if total_bytes > 0 {
        downloaded_bytes as f64 / total_bytes as f64 * 100.0
    } else {
        (previous + 1.0).min(SYNTHETIC_PROGRESS_CAP)
    }
}

/// Shared table of in-flight download states. Progress callbacks may arrive
/// from any thread, so every operation takes the lock for its full duration.
#[derive(Debug, Default)]
pub struct ProgressStore {
    records: Mutex<HashMap<String, ProgressRecord>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ProgressRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert; a new request for an already-known URL overwrites its record.
    pub fn set(&self, key: &str, record: ProgressRecord) {
        self.records().insert(key.to_owned(), record);
    }

    /// Returns a zero-value record for keys never seen.
    pub fn get(&self, key: &str) -> ProgressRecord {
        self.records()
            .get(key)
            .cloned()
            .unwrap_or_else(|| ProgressRecord::reset(Utc::now()))
    }

    /// Read-modify-write under a single lock acquisition, so an update for
    /// one job can never interleave with or clobber another job's update.
    /// Refreshes the record timestamp on every write.
    pub fn update_with<F>(&self, key: &str, apply: F)
    where
        F: FnOnce(&mut ProgressRecord),
    {
        let mut records = self.records();
        let record = records
            .entry(key.to_owned())
            .or_insert_with(|| ProgressRecord::reset(Utc::now()));
        apply(record);
        record.timestamp = Utc::now();
    }

    pub fn mark_complete(&self, key: &str) {
        self.update_with(key, |record| record.progress = 100.0);
    }

    /// Removes every record whose timestamp is older than `ttl`.
    pub fn sweep_expired(&self, ttl: Duration, now: DateTime<Utc>) {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| now - record.timestamp <= ttl);
        let removed = before - records.len();
        if removed > 0 {
            debug!("reaper removed {removed} expired progress record(s)");
        }
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.records().contains_key(key)
    }
}

/// Runs for the lifetime of the process; sweeps the store on a fixed
/// interval. There is no stop signal in normal operation.
pub fn spawn_reaper(store: Arc<ProgressStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(REAPER_INTERVAL_SECONDS)).await;
            store.sweep_expired(Duration::seconds(PROGRESS_TTL_SECONDS), Utc::now());
        }
    })
}
