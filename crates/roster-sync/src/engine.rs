use std::sync::Arc;

use chrono::{DateTime, Utc};
use roster_adapters::{UpstreamError, UpstreamSource};
use roster_core::{FieldChange, RawScheduleRow, ScheduleRecord, SyncRun};
use roster_storage::{ExistingSchedules, ScheduleRepository, ScheduleTransaction, StoreError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("upstream read failed: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("target write failed: {0}")]
    Target(#[from] StoreError),
}

/// Compares upstream schedules against the local table and applies the
/// differences in a single transaction.
#[derive(Clone)]
pub struct SyncEngine {
    upstream: Arc<dyn UpstreamSource>,
    target: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Tally {
    updated: usize,
    inserted: usize,
    unchanged: usize,
    details_updated: Vec<String>,
    details_inserted: Vec<String>,
    changes: Vec<FieldChange>,
}

impl SyncEngine {
    pub fn new(upstream: Arc<dyn UpstreamSource>, target: Arc<dyn ScheduleRepository>) -> Self {
        Self {
            upstream,
            target,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn run_schedule_sync(&self) -> Result<SyncRun, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("schedule_sync", %run_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&self, run_id: Uuid) -> Result<SyncRun, SyncError> {
        let timestamp = self.clock.now();
        let source = self.upstream.describe();
        match self.upstream.source_exists().await {
            Ok(true) => {}
            Ok(false) => warn!(%source, "upstream employee table not listed; querying anyway"),
            Err(err) => warn!(%source, error = %err, "upstream existence probe failed; querying anyway"),
        }

        let rows = self.upstream.fetch_rows().await?;
        debug!(rows = rows.len(), "fetched upstream schedules");
        let existing = self.target.load_existing().await?;
        let phone_cap = self.target.phone_max_length().await?;

        let mut tx = self.target.begin().await?;
        let tally = match apply_rows(tx.as_mut(), &rows, &existing, phone_cap).await {
            Ok(tally) => tally,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed write also failed");
                }
                return Err(err.into());
            }
        };
        tx.commit().await?;

        info!(
            total = rows.len(),
            updated = tally.updated,
            inserted = tally.inserted,
            unchanged = tally.unchanged,
            "schedule sync committed"
        );
        Ok(SyncRun {
            run_id,
            timestamp,
            total: rows.len(),
            updated: tally.updated,
            inserted: tally.inserted,
            unchanged: tally.unchanged,
            details_updated: tally.details_updated,
            details_inserted: tally.details_inserted,
            changes: tally.changes,
            success: true,
            error: None,
        })
    }
}

async fn apply_rows(
    tx: &mut dyn ScheduleTransaction,
    rows: &[RawScheduleRow],
    existing: &ExistingSchedules,
    phone_cap: usize,
) -> Result<Tally, StoreError> {
    let mut tally = Tally::default();
    for raw in rows {
        let mut record = ScheduleRecord::from_raw(raw);
        record.truncate_phone(phone_cap);

        if existing.hash_of(&record.employee_id) == Some(&record.content_hash()) {
            tally.unchanged += 1;
            continue;
        }

        if tx.exists(&record.employee_id).await? {
            tx.update(&record).await?;
            if let Some(stored) = existing.get(&record.employee_id) {
                tally.changes.extend(stored.diff(&record));
            }
            tally.updated += 1;
            tally.details_updated.push(record.detail_line());
        } else {
            tx.insert(&record).await?;
            tally.inserted += 1;
            tally.details_inserted.push(record.detail_line());
        }
    }
    Ok(tally)
}
