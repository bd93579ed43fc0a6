//! Fixture-backed upstream source with failure injection and a fetch gate.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use roster_core::RawScheduleRow;
use tokio::sync::{Mutex, Notify};

use crate::{UpstreamError, UpstreamSource};

#[derive(Debug)]
pub struct MemoryUpstream {
    rows: Mutex<Vec<RawScheduleRow>>,
    failure: Mutex<Option<String>>,
    probe: Mutex<Result<bool, String>>,
    fetch_calls: AtomicU64,
    blocked: AtomicBool,
    release: Notify,
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryUpstream {
    pub fn new(rows: Vec<RawScheduleRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            failure: Mutex::new(None),
            probe: Mutex::new(Ok(true)),
            fetch_calls: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    /// Rows from a JSON array of upstream records.
    pub fn from_json(json: &str) -> Result<Self, UpstreamError> {
        let rows: Vec<RawScheduleRow> = serde_json::from_str(json)?;
        Ok(Self::new(rows))
    }

    pub fn from_fixture(path: &Path) -> Result<Self, UpstreamError> {
        let json = std::fs::read_to_string(path).map_err(|err| {
            UpstreamError::Unavailable(format!("read fixture {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub async fn set_rows(&self, rows: Vec<RawScheduleRow>) {
        *self.rows.lock().await = rows;
    }

    /// Makes every fetch fail with `message` until cleared with `None`.
    pub async fn set_failure(&self, message: Option<&str>) {
        *self.failure.lock().await = message.map(str::to_string);
    }

    pub async fn set_probe(&self, probe: Result<bool, String>) {
        *self.probe.lock().await = probe;
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Holds fetches in flight until [`MemoryUpstream::release_fetches`].
    pub fn block_fetches(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn release_fetches(&self) {
        self.blocked.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl UpstreamSource for MemoryUpstream {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn source_exists(&self) -> Result<bool, UpstreamError> {
        self.probe
            .lock()
            .await
            .clone()
            .map_err(UpstreamError::Unavailable)
    }

    async fn fetch_rows(&self) -> Result<Vec<RawScheduleRow>, UpstreamError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        loop {
            let released = self.release.notified();
            if !self.blocked.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        if let Some(message) = self.failure.lock().await.clone() {
            return Err(UpstreamError::Unavailable(message));
        }
        Ok(self.rows.lock().await.clone())
    }
}
