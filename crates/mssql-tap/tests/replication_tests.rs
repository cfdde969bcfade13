//! End-to-end sync runs against the in-memory source.

mod common;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use common::{int_table, ints, row, select, stream_id, Harness, MemorySource};
use mssql_tap::core::Column;
use mssql_tap::emit::Message;
use mssql_tap::state::State;
use mssql_tap::TapError;

fn int_rows(range: std::ops::Range<i64>, key: &str) -> Vec<mssql_tap::core::Record> {
    range
        .map(|i| row(&[(key, json!(i)), ("value", json!(i * 10))]))
        .collect()
}

// ---------------------------------------------------------------------------
// FULL_TABLE
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_full_table_resumes_after_interruption() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..8, "id"),
        false,
    );
    source.fail_after_batches(Some(2));
    let harness = Harness::new(source.clone(), 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);
    let id = stream_id("full_rows");

    let first = harness.sync(&catalog).await;
    assert!(matches!(first.result, Err(TapError::Stream { .. })));
    assert_eq!(first.column("id"), ints(0..4));
    let versions = first.activate_versions();
    assert_eq!(versions.len(), 1);
    let version = versions[0];

    let saved = harness.store.state();
    assert_eq!(saved.currently_syncing.as_deref(), Some(id.as_str()));
    let bookmark = saved.bookmark(&id).unwrap();
    assert_eq!(bookmark.version, Some(version));
    assert_eq!(bookmark.last_pk_fetched.as_ref().unwrap()["id"], json!(3));
    assert_eq!(bookmark.max_pk_values.as_ref().unwrap()["id"], json!(7));

    source.fail_after_batches(None);
    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    assert_eq!(second.column("id"), ints(4..8));
    assert!(second.record_versions().iter().all(|v| *v == Some(version)));
    assert_eq!(second.activate_versions(), vec![version]);

    let saved = harness.store.state();
    assert_eq!(saved.currently_syncing, None);
    let bookmark = saved.bookmark(&id).unwrap();
    assert_eq!(bookmark.version, Some(version));
    assert!(bookmark.max_pk_values.is_none());
    assert!(bookmark.last_pk_fetched.is_none());
}

#[tokio::test]
async fn test_full_table_new_scan_gets_new_version() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..5, "id"),
        false,
    );
    let harness = Harness::new(source, 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);

    let first = harness.sync(&catalog).await;
    assert!(first.result.is_ok());
    let first_versions = first.activate_versions();
    assert_eq!(first_versions.len(), 2);
    assert_eq!(first_versions[0], first_versions[1]);

    let second = harness.sync(&catalog).await;
    assert_eq!(second.column("id"), ints(0..5));
    let second_versions = second.activate_versions();
    assert_eq!(second_versions.len(), 1, "no leading marker after the first sync");
    assert!(second_versions[0] > first_versions[0]);
}

#[tokio::test]
async fn test_full_table_wide_decimal_key_resumes_exactly() {
    let ids: Vec<Value> = (1..=6)
        .map(|i| serde_json::from_str(&format!("12345678901234567.8{}", i)).unwrap())
        .collect();
    let mut table = int_table("wide_keys", &["id", "value"], &["id"]);
    table.columns[0] = Column {
        precision: 19,
        scale: 2,
        is_nullable: false,
        ordinal_pos: 1,
        ..Column::new("id", "decimal")
    };
    let rows = ids
        .iter()
        .enumerate()
        .map(|(i, id)| row(&[("id", id.clone()), ("value", json!(i))]))
        .collect();

    let source = MemorySource::new();
    source.add_table(table, rows, false);
    source.fail_after_batches(Some(2));
    let harness = Harness::new(source.clone(), 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "wide_keys", "FULL_TABLE", None);
    let id = stream_id("wide_keys");

    let first = harness.sync(&catalog).await;
    assert!(first.result.is_err());
    assert_eq!(first.column("id"), ids[..4].to_vec());

    let saved = harness.store.state();
    let bookmark = saved.bookmark(&id).unwrap();
    assert_eq!(
        bookmark.max_pk_values.as_ref().unwrap()["id"].to_string(),
        "12345678901234567.86"
    );
    assert_eq!(
        bookmark.last_pk_fetched.as_ref().unwrap()["id"].to_string(),
        "12345678901234567.84"
    );

    // Resume from the state document as a later process would read it
    let reloaded = State::from_json(&serde_json::to_string(&saved).unwrap()).unwrap();
    assert_eq!(reloaded, saved);
    source.fail_after_batches(None);
    let second = harness
        .sync_with(&catalog, reloaded, CancellationToken::new())
        .await;
    assert!(second.result.is_ok());
    assert_eq!(second.column("id"), ids[4..].to_vec());
}

#[tokio::test]
async fn test_full_table_empty_table() {
    let source = MemorySource::new();
    source.add_table(int_table("empty", &["id"], &["id"]), Vec::new(), false);
    let harness = Harness::new(source, 10);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "empty", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(run.result.is_ok());
    assert!(run.records().is_empty());
    assert_eq!(run.activate_versions().len(), 2);
}

#[tokio::test]
async fn test_full_table_without_primary_key() {
    let source = MemorySource::new();
    source.add_table(
        int_table("no_pk", &["id", "value"], &[]),
        int_rows(0..3, "id"),
        false,
    );
    let harness = Harness::new(source, 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "no_pk", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(run.result.is_ok());
    assert_eq!(run.records().len(), 3);
}

#[tokio::test]
async fn test_full_table_composite_key() {
    let source = MemorySource::new();
    let rows = vec![
        row(&[("a", json!(2)), ("b", json!(1))]),
        row(&[("a", json!(1)), ("b", json!(2))]),
        row(&[("a", json!(1)), ("b", json!(1))]),
        row(&[("a", json!(2)), ("b", json!(0))]),
    ];
    source.add_table(int_table("pairs", &["a", "b"], &["a", "b"]), rows, false);
    source.fail_after_batches(Some(1));
    let harness = Harness::new(source.clone(), 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "pairs", "FULL_TABLE", None);

    let first = harness.sync(&catalog).await;
    assert!(first.result.is_err());
    assert_eq!(first.column("b"), ints([1, 2]));

    source.fail_after_batches(None);
    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    assert_eq!(second.column("a"), ints([2, 2]));
    assert_eq!(second.column("b"), ints([0, 1]));
}

// ---------------------------------------------------------------------------
// INCREMENTAL
// ---------------------------------------------------------------------------

fn incremental_source() -> MemorySource {
    let source = MemorySource::new();
    let rows = vec![
        row(&[("id", json!(1)), ("updated_at", json!(10))]),
        row(&[("id", json!(2)), ("updated_at", json!(30))]),
        row(&[("id", json!(3)), ("updated_at", json!(20))]),
        row(&[("id", json!(4)), ("updated_at", Value::Null)]),
        row(&[("id", json!(5)), ("updated_at", json!(40))]),
    ];
    source.add_table(int_table("inc_rows", &["id", "updated_at"], &["id"]), rows, false);
    source
}

#[tokio::test]
async fn test_incremental_running_max() {
    let source = incremental_source();
    let harness = Harness::new(source.clone(), 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "inc_rows", "INCREMENTAL", Some("updated_at"));
    let id = stream_id("inc_rows");

    let first = harness.sync(&catalog).await;
    assert!(first.result.is_ok());
    assert_eq!(first.column("id"), ints([4, 1, 3, 2, 5]));
    assert_eq!(first.activate_versions().len(), 2);

    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.replication_key_name.as_deref(), Some("updated_at"));
    assert_eq!(bookmark.replication_key_value, Some(json!(40)));

    source.upsert("inc_rows", row(&[("id", json!(6)), ("updated_at", json!(40))]));
    source.upsert("inc_rows", row(&[("id", json!(7)), ("updated_at", json!(50))]));

    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    // Rows equal to the bookmark are re-emitted
    assert_eq!(second.column("id"), ints([5, 6, 7]));
    assert_eq!(second.activate_versions().len(), 1);
    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.replication_key_value, Some(json!(50)));
}

#[tokio::test]
async fn test_incremental_reset_rescans() {
    let harness = Harness::new(incremental_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "inc_rows", "INCREMENTAL", Some("updated_at"));
    let id = stream_id("inc_rows");

    assert!(harness.sync(&catalog).await.result.is_ok());

    let mut state = harness.store.state();
    state.reset_replication_key(&id);
    let run = harness
        .sync_with(&catalog, state, CancellationToken::new())
        .await;
    assert!(run.result.is_ok());
    assert_eq!(run.records().len(), 5);
}

#[tokio::test]
async fn test_incremental_changed_key_restarts() {
    let harness = Harness::new(incremental_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "inc_rows", "INCREMENTAL", Some("updated_at"));
    let id = stream_id("inc_rows");

    assert!(harness.sync(&catalog).await.result.is_ok());

    select(&mut catalog, "inc_rows", "INCREMENTAL", Some("id"));
    let run = harness.sync(&catalog).await;
    assert!(run.result.is_ok());
    assert_eq!(run.column("id"), ints(1..6));
    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.replication_key_name.as_deref(), Some("id"));
    assert_eq!(bookmark.replication_key_value, Some(json!(5)));
}

#[tokio::test]
async fn test_incremental_without_replication_key_fails() {
    let harness = Harness::new(incremental_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "inc_rows", "INCREMENTAL", None);

    let run = harness.sync(&catalog).await;
    assert!(matches!(run.result, Err(TapError::MissingReplicationKey(_))));
    assert!(run.records().is_empty());
}

// ---------------------------------------------------------------------------
// LOG_BASED
// ---------------------------------------------------------------------------

fn int_data_source() -> MemorySource {
    let source = MemorySource::new();
    source.add_table(
        int_table("int_data", &["pk", "value"], &["pk"]),
        int_rows(0..13, "pk"),
        true,
    );
    source.set_change_version(Some(10));
    source
}

#[tokio::test]
async fn test_log_based_baseline_then_changes() {
    let source = int_data_source();
    let harness = Harness::new(source.clone(), 5);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data", "LOG_BASED", None);
    let id = stream_id("int_data");

    // Baseline: leading, transitional and closing markers
    let first = harness.sync(&catalog).await;
    assert!(first.result.is_ok());
    assert_eq!(first.records().len(), 13);
    let markers = first.activate_versions();
    assert_eq!(markers.len(), 3);
    assert!(markers.iter().all(|v| *v == markers[0]));
    let version = markers[0];
    assert_eq!(first.kinds().last(), Some(&"STATE"));

    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.current_log_version, Some(10));
    assert_eq!(bookmark.initial_full_table_complete, Some(true));
    assert!(bookmark.max_pk_values.is_none());

    // Nothing changed: an empty pass still opens and closes the version
    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    assert!(second.records().is_empty());
    assert_eq!(second.activate_versions(), vec![version, version]);

    source.upsert("int_data", row(&[("pk", json!(13)), ("value", json!(130))]));
    source.upsert("int_data", row(&[("pk", json!(1)), ("value", json!(11))]));
    source.upsert("int_data", row(&[("pk", json!(1)), ("value", json!(12))]));
    source.delete("int_data", vec![json!(1)]);
    assert_eq!(source.change_version(), Some(14));

    let third = harness.sync(&catalog).await;
    assert!(third.result.is_ok());
    let records = third.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["pk"], json!(13));
    assert_eq!(records[0]["value"], json!(130));
    assert_eq!(
        Value::Object(records[1].clone()),
        json!({"pk": 1, "_sdc_deleted_at": "2024-01-02T03:04:05.000000000Z"})
    );
    assert!(third.record_versions().iter().all(|v| *v == Some(version)));

    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.current_log_version, Some(14));
}

#[tokio::test]
async fn test_log_based_schema_has_deleted_at() {
    let harness = Harness::new(int_data_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data", "LOG_BASED", None);

    let run = harness.sync(&catalog).await;
    let schema = run
        .messages
        .iter()
        .find_map(|m| match m {
            Message::Schema { schema, key_properties, .. } => Some((schema.clone(), key_properties.clone())),
            _ => None,
        })
        .unwrap();
    assert!(schema.0["properties"]["_sdc_deleted_at"].is_object());
    assert_eq!(schema.1, vec!["pk".to_string()]);
}

#[tokio::test]
async fn test_log_based_resumes_interrupted_baseline() {
    let source = int_data_source();
    source.fail_after_batches(Some(1));
    let harness = Harness::new(source.clone(), 5);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data", "LOG_BASED", None);
    let id = stream_id("int_data");

    let first = harness.sync(&catalog).await;
    assert!(first.result.is_err());
    assert_eq!(first.column("pk"), ints(0..5));
    let bookmark = harness.store.state().bookmark(&id).cloned().unwrap();
    assert_eq!(bookmark.initial_full_table_complete, Some(false));
    assert_eq!(bookmark.current_log_version, Some(10));

    // Changes made during the snapshot are replayed afterwards
    source.upsert("int_data", row(&[("pk", json!(2)), ("value", json!(-2))]));
    source.fail_after_batches(None);

    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    let mut pks = second.column("pk");
    assert_eq!(pks.pop(), Some(json!(2)));
    assert_eq!(pks, ints(5..13));
    assert_eq!(second.activate_versions().len(), 2);
}

#[tokio::test]
async fn test_log_based_null_log_version_is_invalid_state() {
    let harness = Harness::new(int_data_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data", "LOG_BASED", None);
    let id = stream_id("int_data");

    let state = State::from_json(&format!(
        r#"{{"bookmarks": {{"{}": {{"version": 1, "initial_full_table_complete": true}}}}}}"#,
        id
    ))
    .unwrap();
    let run = harness
        .sync_with(&catalog, state, CancellationToken::new())
        .await;
    assert!(matches!(run.result, Err(TapError::InvalidState { .. })));
    assert!(run.records().is_empty());
}

#[tokio::test]
async fn test_log_based_expired_retention() {
    let source = int_data_source();
    let harness = Harness::new(source.clone(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data", "LOG_BASED", None);

    assert!(harness.sync(&catalog).await.result.is_ok());

    source.set_min_valid_version(Some(11));
    let run = harness.sync(&catalog).await;
    match run.result {
        Err(TapError::ChangeTrackingExpired {
            min_valid,
            bookmarked,
            ..
        }) => {
            assert_eq!(min_valid, 11);
            assert_eq!(bookmarked, 10);
        }
        other => panic!("expected expired change tracking, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_log_based_without_primary_key() {
    let source = MemorySource::new();
    source.add_table(
        int_table("int_data_no_pk", &["pk", "value"], &[]),
        int_rows(0..3, "pk"),
        false,
    );
    let harness = Harness::new(source, 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "int_data_no_pk", "LOG_BASED", None);

    let run = harness.sync(&catalog).await;
    let err = run.result.as_ref().unwrap_err();
    assert!(err
        .to_string()
        .contains("Change Tracking is not enabled for table: int_data_no_pk"));
    assert!(run.records().is_empty());
}

#[tokio::test]
async fn test_log_based_change_tracking_disabled() {
    let source = MemorySource::new();
    source.add_table(
        int_table("ct_off", &["pk", "value"], &["pk"]),
        int_rows(0..3, "pk"),
        false,
    );
    source.set_change_version(Some(1));
    let harness = Harness::new(source, 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "ct_off", "LOG_BASED", None);

    let run = harness.sync(&catalog).await;
    assert!(matches!(
        run.result,
        Err(TapError::ChangeTrackingNotEnabled { ref table, .. }) if table == "ct_off"
    ));
}

#[tokio::test]
async fn test_log_based_on_view_fails() {
    let source = MemorySource::new();
    let mut view = int_table("a_view", &["pk", "value"], &[]);
    view.is_view = true;
    source.add_table(view, int_rows(0..3, "pk"), false);
    let harness = Harness::new(source, 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "a_view", "LOG_BASED", None);

    let run = harness.sync(&catalog).await;
    assert!(matches!(run.result, Err(TapError::ChangeTrackingOnView { .. })));
}

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

fn two_stream_source() -> MemorySource {
    let source = MemorySource::new();
    let mut view = int_table("a_view", &["pk", "value"], &[]);
    view.is_view = true;
    source.add_table(view, int_rows(0..3, "pk"), false);
    source.add_table(
        int_table("b_rows", &["id", "value"], &["id"]),
        int_rows(0..3, "id"),
        false,
    );
    source
}

#[tokio::test]
async fn test_failed_stream_does_not_stop_later_streams() {
    let harness = Harness::new(two_stream_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "a_view", "LOG_BASED", None);
    select(&mut catalog, "b_rows", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(matches!(run.result, Err(TapError::ChangeTrackingOnView { .. })));
    assert_eq!(run.column("id"), ints(0..3));
}

#[tokio::test]
async fn test_stop_on_first_failure() {
    let mut harness = Harness::new(two_stream_source(), 100);
    harness.config.sync.continue_on_error = false;
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "a_view", "LOG_BASED", None);
    select(&mut catalog, "b_rows", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(run.result.is_err());
    assert!(run.records().is_empty());
}

#[tokio::test]
async fn test_currently_syncing_stream_runs_first() {
    let source = MemorySource::new();
    for name in ["a_rows", "b_rows"] {
        source.add_table(
            int_table(name, &["id", "value"], &["id"]),
            int_rows(0..2, "id"),
            false,
        );
    }
    let harness = Harness::new(source, 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "a_rows", "FULL_TABLE", None);
    select(&mut catalog, "b_rows", "FULL_TABLE", None);

    let state = State {
        currently_syncing: Some(stream_id("b_rows")),
        ..State::default()
    };
    let run = harness
        .sync_with(&catalog, state, CancellationToken::new())
        .await;
    assert!(run.result.is_ok());
    let order: Vec<String> = run
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::Schema { tap_stream_id, .. } => Some(tap_stream_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec![stream_id("b_rows"), stream_id("a_rows")]);
}

#[tokio::test]
async fn test_unselected_streams_are_skipped() {
    let harness = Harness::new(two_stream_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "b_rows", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    let result = run.result.unwrap();
    assert_eq!(result.streams_total, 1);
    assert_eq!(result.streams_succeeded, 1);
    assert_eq!(result.records_emitted, 3);
}

#[tokio::test]
async fn test_cancelled_before_first_stream() {
    let harness = Harness::new(two_stream_source(), 100);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "b_rows", "FULL_TABLE", None);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let run = harness
        .sync_with(&catalog, State::default(), cancel)
        .await;
    let err = run.result.as_ref().unwrap_err();
    assert!(matches!(err, TapError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert!(run.records().is_empty());
}

#[tokio::test]
async fn test_cancelled_mid_scan_stops_at_batch_boundary() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..6, "id"),
        false,
    );
    let harness = Harness::new(source.clone(), 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);
    let id = stream_id("full_rows");

    let cancel = CancellationToken::new();
    source.cancel_on_next_read(cancel.clone());
    let first = harness
        .sync_with(&catalog, State::default(), cancel)
        .await;
    let err = first.result.as_ref().unwrap_err();
    assert!(matches!(err, TapError::Cancelled));
    assert_eq!(err.exit_code(), 130);
    assert_eq!(first.column("id"), ints(0..2));
    assert_eq!(first.last_state(), Some(harness.store.state()));

    let saved = harness.store.state();
    assert_eq!(saved.currently_syncing.as_deref(), Some(id.as_str()));
    let bookmark = saved.bookmark(&id).unwrap();
    assert_eq!(bookmark.last_pk_fetched.as_ref().unwrap()["id"], json!(1));
    assert_eq!(bookmark.max_pk_values.as_ref().unwrap()["id"], json!(5));
    let version = bookmark.version.unwrap();

    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    assert_eq!(second.column("id"), ints(2..6));
    assert!(second.record_versions().iter().all(|v| *v == Some(version)));
    assert_eq!(harness.store.state().currently_syncing, None);
}

#[tokio::test]
async fn test_failed_flush_keeps_last_acknowledged_key() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..6, "id"),
        false,
    );
    let harness = Harness::new(source, 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);
    let id = stream_id("full_rows");

    let first = harness.sync_failing_flush(&catalog, 2).await;
    assert!(matches!(first.result, Err(TapError::Io(_))));
    // Rows 2 and 3 reached the sink but were never acknowledged
    assert_eq!(first.column("id"), ints(0..4));

    let saved = harness.store.state();
    assert_eq!(saved.currently_syncing.as_deref(), Some(id.as_str()));
    let bookmark = saved.bookmark(&id).unwrap();
    assert_eq!(bookmark.last_pk_fetched.as_ref().unwrap()["id"], json!(1));
    let version = bookmark.version.unwrap();

    let second = harness.sync(&catalog).await;
    assert!(second.result.is_ok());
    assert_eq!(second.column("id"), ints(2..6));
    assert!(second.record_versions().iter().all(|v| *v == Some(version)));
}

#[tokio::test]
async fn test_state_messages_match_saved_state() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..6, "id"),
        false,
    );
    let harness = Harness::new(source, 2);
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(run.result.is_ok());
    assert_eq!(run.last_state(), Some(harness.store.state()));
    assert_eq!(run.sink.flushed(), run.messages.len() - 1);

    // Every batch of records is followed by a STATE message
    let kinds = run.kinds();
    let states = kinds.iter().filter(|k| **k == "STATE").count();
    assert_eq!(states, harness.store.saves());
    for (i, kind) in kinds.iter().enumerate() {
        if *kind == "RECORD" && kinds.get(i + 1) != Some(&"RECORD") {
            assert_eq!(kinds[i + 1], "STATE");
        }
    }
}

#[tokio::test]
async fn test_state_messages_can_be_disabled() {
    let source = MemorySource::new();
    source.add_table(
        int_table("full_rows", &["id", "value"], &["id"]),
        int_rows(0..4, "id"),
        false,
    );
    let mut harness = Harness::new(source, 2);
    harness.config.sync.emit_state_messages = false;
    let mut catalog = harness.catalog().await;
    select(&mut catalog, "full_rows", "FULL_TABLE", None);

    let run = harness.sync(&catalog).await;
    assert!(run.result.is_ok());
    assert!(!run.kinds().contains(&"STATE"));
    assert!(harness.store.saves() > 0);
}
