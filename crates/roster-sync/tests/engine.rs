use std::sync::Arc;

use roster_adapters::memory::MemoryUpstream;
use roster_core::{RawScheduleRow, ScheduleRecord};
use roster_storage::memory::{MemoryRunLogStore, MemoryScheduleRepository};
use roster_storage::RunLogStore;
use chrono::DateTime;
use roster_sync::{run_and_record, FixedClock, SyncEngine, SyncError};

fn orange_row(id: &str, name: &str, time_out: &str, next_day: &str) -> RawScheduleRow {
    RawScheduleRow {
        employee_id: id.into(),
        employee_name: Some(name.into()),
        gender: Some("F".into()),
        division: Some("Operations".into()),
        department: Some("Mining".into()),
        section: Some("Shift A".into()),
        supervisor_id: Some("S01".into()),
        supervisor_name: Some("Bob Hart".into()),
        position_title: Some("Operator".into()),
        grade_interval: Some("G3".into()),
        phone: Some("0812-1111-2222".into()),
        day_type: Some("D1".into()),
        description: Some("Day shift".into()),
        time_in: Some("08:00".into()),
        time_out: Some(time_out.into()),
        next_day: Some(next_day.into()),
    }
}

struct Fixture {
    upstream: Arc<MemoryUpstream>,
    target: MemoryScheduleRepository,
    engine: SyncEngine,
}

fn fixture(rows: Vec<RawScheduleRow>) -> Fixture {
    let upstream = Arc::new(MemoryUpstream::new(rows));
    let target = MemoryScheduleRepository::new();
    let engine = SyncEngine::new(upstream.clone(), Arc::new(target.clone()));
    Fixture {
        upstream,
        target,
        engine,
    }
}

#[tokio::test]
async fn classifies_inserted_unchanged_and_updated_rows() {
    let fx = fixture(vec![
        orange_row("E1", "Jane Doe", "16:00", "N"),
        orange_row("E2", "Arif Rahman", "06:00", "Y"),
    ]);
    fx.target
        .seed([ScheduleRecord::from_raw(&orange_row("E1", "Jane Doe", "16:00", "0"))])
        .await;

    let first = fx.engine.run_schedule_sync().await.expect("first run");
    assert_eq!(first.total, 2);
    assert_eq!((first.inserted, first.updated, first.unchanged), (1, 0, 1));
    assert_eq!(first.details_inserted, vec!["E2 | Arif Rahman | D1 | 08:00-06:00 | 1"]);
    assert!(first.details_updated.is_empty());
    assert!(first.success);

    fx.upstream
        .set_rows(vec![
            orange_row("E1", "Jane Doe", "17:00", "N"),
            orange_row("E2", "Arif Rahman", "06:00", "Y"),
        ])
        .await;
    let second = fx.engine.run_schedule_sync().await.expect("second run");
    assert_eq!((second.inserted, second.updated, second.unchanged), (0, 1, 1));
    assert_eq!(second.details_updated, vec!["E1 | Jane Doe | D1 | 08:00-17:00 | 0"]);
    assert_eq!(second.changes.len(), 1);
    assert_eq!(second.changes[0].field, "time_out");
    assert_eq!(second.changes[0].old_value, "16:00");
    assert_eq!(second.changes[0].new_value, "17:00");

    let stored = fx.target.get("E1").await.expect("row");
    assert_eq!(stored.time_out, "17:00");
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn second_run_over_same_data_changes_nothing() {
    let fx = fixture(vec![
        orange_row("E1", "Jane Doe", "16:00", "no"),
        orange_row("E2", "Arif Rahman", "06:00", "TRUE"),
        orange_row("E3", "Dewi Lestari", "15:00", ""),
    ]);

    let first = fx.engine.run_schedule_sync().await.expect("first run");
    assert_eq!(first.inserted, 3);
    let after_first = fx.target.rows().await;

    let second = fx.engine.run_schedule_sync().await.expect("second run");
    assert_eq!((second.inserted, second.updated, second.unchanged), (0, 0, 3));
    assert!(second.changes.is_empty());
    assert!(!second.has_changes());
    assert_eq!(fx.target.rows().await, after_first);
}

#[tokio::test]
async fn phone_is_cut_to_column_width_before_hashing() {
    let mut row = orange_row("E1", "Jane Doe", "16:00", "N");
    row.phone = Some("+62 812 3456 7890 ext 12".into());
    let fx = fixture(vec![row]);
    fx.target.set_phone_max_length(10);

    let first = fx.engine.run_schedule_sync().await.expect("first run");
    assert_eq!(first.inserted, 1);
    assert_eq!(fx.target.get("E1").await.expect("row").phone, "+62 812 34");

    let second = fx.engine.run_schedule_sync().await.expect("second run");
    assert_eq!(second.unchanged, 1, "truncated phone must compare equal");
}

#[tokio::test]
async fn failed_write_leaves_table_untouched() {
    let fx = fixture(vec![
        orange_row("E1", "Jane Doe", "17:00", "N"),
        orange_row("E2", "Arif Rahman", "06:00", "Y"),
        orange_row("E3", "Dewi Lestari", "15:00", "N"),
    ]);
    let seeded = ScheduleRecord::from_raw(&orange_row("E1", "Jane Doe", "16:00", "N"));
    fx.target.seed([seeded.clone()]).await;
    fx.target.fail_on_write(3);

    let err = fx.engine.run_schedule_sync().await.expect_err("third write fails");
    assert!(matches!(err, SyncError::Target(_)));
    assert_eq!(fx.target.rows().await, vec![seeded]);
    assert_eq!(fx.target.commits(), 0);
    assert_eq!(fx.target.rollbacks(), 1);
}

#[tokio::test]
async fn upstream_failure_opens_no_transaction() {
    let fx = fixture(Vec::new());
    fx.upstream.set_failure(Some("Invalid object name 'dbo.it_mti_employee_database_tbl'")).await;

    let err = fx.engine.run_schedule_sync().await.expect_err("upstream down");
    assert!(matches!(err, SyncError::Upstream(_)));
    assert!(err.to_string().contains("Invalid object name"));
    assert_eq!(fx.target.begin_calls(), 0);
}

#[tokio::test]
async fn unreadable_target_fails_before_any_write() {
    let fx = fixture(vec![orange_row("E1", "Jane Doe", "16:00", "N")]);
    fx.target.fail_loads(true);

    let err = fx.engine.run_schedule_sync().await.expect_err("target down");
    assert!(matches!(err, SyncError::Target(_)));
    assert!(err.to_string().contains("schedule table offline"));
    assert_eq!(fx.target.begin_calls(), 0);
    assert!(fx.target.rows().await.is_empty());
}

#[tokio::test]
async fn run_timestamps_come_from_the_engine_clock() {
    let start = DateTime::from_timestamp(1_760_000_000, 0).expect("timestamp");
    let clock = Arc::new(FixedClock::new(start));
    let upstream = Arc::new(MemoryUpstream::new(vec![orange_row("E1", "Jane Doe", "16:00", "N")]));
    let target = MemoryScheduleRepository::new();
    let engine = SyncEngine::new(upstream.clone(), Arc::new(target.clone())).with_clock(clock.clone());
    let logs = MemoryRunLogStore::new();

    let first = engine.run_schedule_sync().await.expect("first run");
    assert_eq!(first.timestamp, start);

    clock.advance(std::time::Duration::from_secs(300));
    upstream.set_failure(Some("connection reset")).await;
    assert!(run_and_record(&engine, &logs).await.is_err());
    let failed = logs.latest().await.expect("latest").expect("entry");
    assert_eq!((failed.run.timestamp - start).num_seconds(), 300);
}

#[tokio::test]
async fn empty_upstream_is_a_successful_noop() {
    let fx = fixture(Vec::new());
    fx.target
        .seed([ScheduleRecord::from_raw(&orange_row("E1", "Jane Doe", "16:00", "N"))])
        .await;

    let run = fx.engine.run_schedule_sync().await.expect("run");
    assert_eq!((run.total, run.inserted, run.updated, run.unchanged), (0, 0, 0, 0));
    assert_eq!(fx.target.rows().await.len(), 1, "rows missing upstream are kept");
}

#[tokio::test]
async fn recorded_runs_include_failures() {
    let fx = fixture(vec![orange_row("E1", "Jane Doe", "16:00", "N")]);
    let logs = MemoryRunLogStore::new();

    let entry = run_and_record(&fx.engine, &logs).await.expect("recorded");
    assert_eq!(entry.id, 1);
    assert_eq!(entry.run.inserted, 1);

    fx.upstream.set_failure(Some("connection reset")).await;
    assert!(run_and_record(&fx.engine, &logs).await.is_err());

    let latest = logs.latest().await.expect("latest").expect("entry");
    assert_eq!(latest.id, 2);
    assert!(!latest.run.success);
    assert_eq!(latest.run.total, 0);
    assert!(latest
        .run
        .error
        .as_deref()
        .is_some_and(|message| message.contains("connection reset")));
}
