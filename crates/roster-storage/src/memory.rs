//! In-memory stores for tests and for running the engine without a database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use roster_core::{LogPage, LogQuery, ScheduleRecord, SyncLogEntry, SyncRun, SyncSettings};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ExistingSchedules, RunLogStore, ScheduleRepository, ScheduleTransaction, SettingsStore,
    StoreError,
};

#[derive(Debug, Default)]
struct MemoryTable {
    rows: Mutex<BTreeMap<String, ScheduleRecord>>,
    phone_max_length: AtomicUsize,
    fail_on_write: AtomicUsize,
    fail_loads: AtomicBool,
    begin_calls: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Schedule table backed by a map. Transactions work on a snapshot that
/// replaces the table on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryScheduleRepository {
    inner: Arc<MemoryTable>,
}

impl MemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = ScheduleRecord>) {
        let mut rows = self.inner.rows.lock().await;
        for record in records {
            rows.insert(record.employee_id.clone(), record);
        }
    }

    pub async fn rows(&self) -> Vec<ScheduleRecord> {
        self.inner.rows.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, employee_id: &str) -> Option<ScheduleRecord> {
        self.inner.rows.lock().await.get(employee_id).cloned()
    }

    /// Reported width of the phone column; 0 leaves phones untouched.
    pub fn set_phone_max_length(&self, max_len: usize) {
        self.inner.phone_max_length.store(max_len, Ordering::SeqCst);
    }

    /// Fails the `n`th write (1-based) of every transaction; 0 disables.
    pub fn fail_on_write(&self, n: usize) {
        self.inner.fail_on_write.store(n, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.inner.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn begin_calls(&self) -> u64 {
        self.inner.begin_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduleRepository for MemoryScheduleRepository {
    async fn load_existing(&self) -> Result<ExistingSchedules, StoreError> {
        if self.inner.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("schedule table offline".to_string()));
        }
        let rows = self.inner.rows.lock().await;
        Ok(ExistingSchedules::new(rows.values().cloned()))
    }

    async fn phone_max_length(&self) -> Result<usize, StoreError> {
        Ok(self.inner.phone_max_length.load(Ordering::SeqCst))
    }

    async fn begin(&self) -> Result<Box<dyn ScheduleTransaction>, StoreError> {
        self.inner.begin_calls.fetch_add(1, Ordering::SeqCst);
        let staged = self.inner.rows.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            table: Arc::clone(&self.inner),
            staged,
            writes: 0,
        }))
    }
}

struct MemoryTransaction {
    table: Arc<MemoryTable>,
    staged: BTreeMap<String, ScheduleRecord>,
    writes: usize,
}

impl MemoryTransaction {
    fn record_write(&mut self) -> Result<(), StoreError> {
        self.writes += 1;
        let fail_at = self.table.fail_on_write.load(Ordering::SeqCst);
        if fail_at > 0 && self.writes == fail_at {
            return Err(StoreError::Unavailable(format!(
                "write {fail_at} rejected by target"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleTransaction for MemoryTransaction {
    async fn exists(&mut self, employee_id: &str) -> Result<bool, StoreError> {
        Ok(self.staged.contains_key(employee_id))
    }

    async fn insert(&mut self, record: &ScheduleRecord) -> Result<(), StoreError> {
        self.record_write()?;
        if self.staged.contains_key(&record.employee_id) {
            return Err(StoreError::Unavailable(format!(
                "duplicate employee_id {}",
                record.employee_id
            )));
        }
        self.staged
            .insert(record.employee_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&mut self, record: &ScheduleRecord) -> Result<(), StoreError> {
        self.record_write()?;
        match self.staged.get_mut(&record.employee_id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(StoreError::Unavailable(format!(
                "no row for employee_id {}",
                record.employee_id
            ))),
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { table, staged, .. } = *self;
        *table.rows.lock().await = staged;
        table.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.table.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Run log kept in a vector, ids assigned from 1 upward.
#[derive(Debug, Default)]
pub struct MemoryRunLogStore {
    entries: Mutex<Vec<SyncLogEntry>>,
    last_id: AtomicI64,
    fail_appends: AtomicBool,
    append_calls: AtomicU64,
}

impl MemoryRunLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn append_calls(&self) -> u64 {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub async fn entries(&self) -> Vec<SyncLogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl RunLogStore for MemoryRunLogStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn append(&self, run: &SyncRun) -> Result<i64, StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("run log offline".to_string()));
        }
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().await.push(SyncLogEntry {
            id,
            run: run.clone(),
        });
        Ok(id)
    }

    async fn latest(&self) -> Result<Option<SyncLogEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().max_by_key(|entry| entry.id).cloned())
    }

    async fn query(&self, query: LogQuery) -> Result<LogPage, StoreError> {
        let query = query.normalized();
        let entries = self.entries.lock().await;
        let mut matching = entries
            .iter()
            .filter(|entry| !query.only_with_changes || entry.run.has_changes())
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        let total = matching.len() as u64;

        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(query.limit()).unwrap_or(usize::MAX);
        let logs = matching
            .into_iter()
            .filter(|entry| query.before_id.map_or(true, |before| entry.id < before))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok(LogPage::new(logs, query, total))
    }

    async fn find_by_run_id(&self, run_id: Uuid) -> Result<Option<SyncLogEntry>, StoreError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|entry| entry.run.run_id == run_id)
            .max_by_key(|entry| entry.id)
            .cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: Mutex<Option<SyncSettings>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        Self {
            settings: Mutex::new(Some(settings)),
            ..Self::default()
        }
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub async fn current(&self) -> Option<SyncSettings> {
        self.settings.lock().await.clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load_or_init(&self, defaults: &SyncSettings) -> Result<SyncSettings, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("settings table offline".to_string()));
        }
        let mut settings = self.settings.lock().await;
        Ok(settings.get_or_insert_with(|| defaults.clone()).clone())
    }

    async fn save(&self, settings: &SyncSettings) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("settings table offline".to_string()));
        }
        *self.settings.lock().await = Some(settings.clone());
        Ok(())
    }
}
