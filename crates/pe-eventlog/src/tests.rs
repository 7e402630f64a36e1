// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::*;
use chrono::{TimeZone, Utc};
use pe_core::{EventType, Role};
use uuid::Uuid;

fn builder(event_type: EventType) -> EventBuilder {
    EventBuilder::new(Uuid::new_v4(), Uuid::new_v4(), Role::Pm, event_type)
}

#[tokio::test]
async fn append_assigns_sequential_ids() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let first = log.append(builder(EventType::Request).build()).await.unwrap();
    let second = log.append(builder(EventType::Response).build()).await.unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 2);
}

#[tokio::test]
async fn append_rejects_missing_parent() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let err = log
        .append(builder(EventType::Response).parent(999).build())
        .await
        .unwrap_err();

    assert!(matches!(err, EventLogError::BrokenParent { missing_parent: 999, .. }));
}

#[tokio::test]
async fn append_accepts_existing_parent() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let root = log.append(builder(EventType::Request).build()).await.unwrap();
    let child = log
        .append(builder(EventType::Response).parent(root).build())
        .await
        .unwrap();

    assert_eq!(child, 2);
}

#[tokio::test]
async fn chain_returns_root_to_leaf_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let root = log.append(builder(EventType::Request).build()).await.unwrap();
    let mid = log
        .append(builder(EventType::Response).parent(root).build())
        .await
        .unwrap();
    let leaf = log
        .append(builder(EventType::Decision).parent(mid).build())
        .await
        .unwrap();

    let chain = log.chain(leaf).await.unwrap();
    let ids: Vec<_> = chain.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![root, mid, leaf]);
}

#[tokio::test]
async fn read_returns_events_recorded_for_the_day() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let today = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
    log.append(builder(EventType::Request).timestamp(today).build())
        .await
        .unwrap();
    log.append(builder(EventType::Response).timestamp(today).build())
        .await
        .unwrap();

    let events = log.read(today.date_naive()).await.unwrap();
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn read_on_a_day_with_no_events_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let events = log.read(Utc::now().date_naive()).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn read_skips_corrupt_lines_and_counts_them() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 30).await.unwrap();

    let today = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
    log.append(builder(EventType::Request).timestamp(today).build())
        .await
        .unwrap();

    let day_path = dir.path().join("stream").join("2026-08-01.jsonl");
    let mut contents = tokio::fs::read_to_string(&day_path).await.unwrap();
    contents.push_str("not valid json\n");
    tokio::fs::write(&day_path, contents).await.unwrap();

    let events = log.read(today.date_naive()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(log.corrupt_line_count(), 1);
}

#[tokio::test]
async fn hydration_skips_corrupt_lines_and_resumes_ids() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = EventLog::open(dir.path(), 30).await.unwrap();
        let today = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        log.append(builder(EventType::Request).timestamp(today).build())
            .await
            .unwrap();
        log.append(builder(EventType::Response).timestamp(today).build())
            .await
            .unwrap();

        let day_path = dir.path().join("stream").join("2026-08-01.jsonl");
        let mut contents = tokio::fs::read_to_string(&day_path).await.unwrap();
        contents.push_str("{garbage\n");
        tokio::fs::write(&day_path, contents).await.unwrap();
    }

    let reopened = EventLog::open(dir.path(), 30).await.unwrap();
    assert_eq!(reopened.corrupt_line_count(), 1);

    let next = reopened.append(builder(EventType::Decision).build()).await.unwrap();
    assert_eq!(next, 3);
}

#[tokio::test]
async fn archive_due_moves_old_day_files_only() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 7).await.unwrap();

    let old_day = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
    let recent_day = Utc.with_ymd_and_hms(2026, 7, 30, 0, 0, 0).unwrap();
    log.append(builder(EventType::Request).timestamp(old_day).build())
        .await
        .unwrap();
    log.append(builder(EventType::Request).timestamp(recent_day).build())
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
    let archived = log.archive_due(now).await.unwrap();

    assert_eq!(archived.len(), 1);
    assert!(dir.path().join("stream/archive/2026-07-01.jsonl").exists());
    assert!(dir.path().join("stream/2026-07-30.jsonl").exists());
}

#[tokio::test]
async fn archived_day_is_still_readable() {
    let dir = tempfile::tempdir().unwrap();
    let log = EventLog::open(dir.path(), 7).await.unwrap();

    let old_day = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
    log.append(builder(EventType::Request).timestamp(old_day).build())
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
    log.archive_due(now).await.unwrap();

    let events = log.read(old_day.date_naive()).await.unwrap();
    assert_eq!(events.len(), 1);
}
