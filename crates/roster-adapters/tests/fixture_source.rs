use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use roster_adapters::memory::MemoryUpstream;
use roster_adapters::UpstreamSource;
use roster_core::ScheduleRecord;

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/upstream/orange_sample.json")
}

#[tokio::test]
async fn sample_fixture_loads_one_row_per_employee() {
    let source = MemoryUpstream::from_fixture(&fixture_path()).expect("fixture");
    let rows = source.fetch_rows().await.expect("rows");
    assert_eq!(rows.len(), 3);

    let night = ScheduleRecord::from_raw(&rows[1]);
    assert_eq!(night.employee_id, "E1002");
    assert!(night.is_next_day());
    assert_eq!(night.next_day, "1");

    let rest_day = ScheduleRecord::from_raw(&rows[2]);
    assert_eq!(rest_day.phone, "");
    assert_eq!(rest_day.next_day, "0");
    assert_eq!(source.fetch_calls(), 1);
}

#[tokio::test]
async fn injected_failure_surfaces_as_upstream_error() {
    let source = MemoryUpstream::default();
    source.set_failure(Some("login failed for user 'sync'")).await;
    let err = source.fetch_rows().await.expect_err("failure");
    assert!(err.to_string().contains("login failed"));

    source.set_failure(None).await;
    assert!(source.fetch_rows().await.expect("rows").is_empty());
}

#[tokio::test]
async fn probe_result_is_configurable() {
    let source = MemoryUpstream::default();
    assert!(source.source_exists().await.expect("probe"));
    source.set_probe(Ok(false)).await;
    assert!(!source.source_exists().await.expect("probe"));
    source.set_probe(Err("permission denied".into())).await;
    assert!(source.source_exists().await.is_err());
}

#[tokio::test]
async fn blocked_fetch_waits_for_release() {
    let source = Arc::new(MemoryUpstream::default());
    source.block_fetches();

    let pending = tokio::spawn({
        let source = Arc::clone(&source);
        async move { source.fetch_rows().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());
    assert_eq!(source.fetch_calls(), 1);

    source.release_fetches();
    let rows = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("released in time")
        .expect("join")
        .expect("rows");
    assert!(rows.is_empty());
}

#[test]
fn malformed_fixture_is_rejected() {
    assert!(MemoryUpstream::from_json("{\"employee_id\": 1}").is_err());
}
