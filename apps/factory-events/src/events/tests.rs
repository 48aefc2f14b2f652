use super::types::{EventRecord, HealthStatus, IncomingEvent, IngestSummary, RejectionReason};
use super::{BatchIngestor, IngestError, StatsService, MAX_DURATION_MS};
use crate::store::{EventStore, MemoryEventStore, StoreError, StoreWrite, WriteReport};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap()
}

fn event(id: &str, machine_id: &str, event_time: DateTime<Utc>, defect_count: i32) -> IncomingEvent {
    IncomingEvent {
        event_id: id.to_string(),
        event_time: Some(event_time),
        machine_id: machine_id.to_string(),
        duration_ms: Some(1_000),
        defect_count,
        factory_id: Some("F01".to_string()),
        line_id: Some("L1".to_string()),
    }
}

fn setup() -> (Arc<MemoryEventStore>, BatchIngestor, StatsService) {
    let store = Arc::new(MemoryEventStore::new());
    let ingestor = BatchIngestor::new(store.clone());
    let stats = StatsService::new(store.clone());
    (store, ingestor, stats)
}

#[tokio::test]
async fn empty_batch_reports_zeros() -> Result<()> {
    let (store, ingestor, _) = setup();
    let summary = ingestor.ingest_batch(Vec::new()).await?;
    assert_eq!(summary, IngestSummary::default());
    assert!(store.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn identical_resubmission_is_deduped() -> Result<()> {
    let (store, ingestor, _) = setup();
    let batch = vec![event("E-1", "M-001", t0(), 2)];

    let first = ingestor.ingest_batch_at(batch.clone(), t0() + Duration::hours(1)).await?;
    assert_eq!((first.accepted, first.deduped), (1, 0));

    let second = ingestor.ingest_batch_at(batch, t0() + Duration::hours(2)).await?;
    assert_eq!((second.accepted, second.deduped, second.updated), (0, 1, 0));

    let stored = store.get("E-1").await.expect("stored");
    assert_eq!(stored.received_time, t0() + Duration::hours(1));
    Ok(())
}

#[tokio::test]
async fn newer_arrival_with_new_content_updates() -> Result<()> {
    let (store, ingestor, _) = setup();
    ingestor
        .ingest_batch_at(vec![event("E-1", "M-001", t0(), 2)], t0() + Duration::hours(1))
        .await?;

    let mut changed = event("E-1", "M-002", t0() + Duration::minutes(5), 9);
    changed.line_id = None;
    let summary = ingestor
        .ingest_batch_at(vec![changed], t0() + Duration::hours(2))
        .await?;
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.accepted + summary.deduped, 0);

    let stored = store.get("E-1").await.expect("stored");
    assert_eq!(stored.content.machine_id, "M-002");
    assert_eq!(stored.content.defect_count, 9);
    assert_eq!(stored.content.line_id, None);
    assert_eq!(stored.received_time, t0() + Duration::hours(2));
    assert_eq!(stored.version, 1);
    Ok(())
}

#[tokio::test]
async fn conflicting_content_does_not_overwrite_later_receipt() -> Result<()> {
    let (store, ingestor, _) = setup();
    ingestor
        .ingest_batch_at(vec![event("E-1", "M-001", t0(), 2)], t0() + Duration::hours(1))
        .await?;

    let mut advanced = store.get("E-1").await.expect("stored");
    advanced.received_time = t0() + Duration::days(1);
    store.put(advanced.clone()).await;

    let summary = ingestor
        .ingest_batch_at(vec![event("E-1", "M-001", t0(), 5)], t0() + Duration::hours(2))
        .await?;
    assert_eq!((summary.deduped, summary.updated), (1, 0));
    assert_eq!(store.get("E-1").await, Some(advanced));
    Ok(())
}

#[tokio::test]
async fn duration_and_future_bounds_reject_per_item() -> Result<()> {
    let (store, ingestor, _) = setup();
    let now = t0() + Duration::hours(1);

    let mut negative = event("neg", "M-001", t0(), 0);
    negative.duration_ms = Some(-1);
    let mut too_long = event("long", "M-001", t0(), 0);
    too_long.duration_ms = Some(MAX_DURATION_MS + 1);
    let mut zero = event("zero", "M-001", t0(), 0);
    zero.duration_ms = Some(0);
    let mut six_hours = event("six", "M-001", t0(), 0);
    six_hours.duration_ms = Some(MAX_DURATION_MS);
    let future = event("future", "M-001", now + Duration::minutes(20), 0);
    let edge = event("edge", "M-001", now + Duration::minutes(15), 0);

    let summary = ingestor
        .ingest_batch_at(vec![negative, too_long, zero, six_hours, future, edge], now)
        .await?;

    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.rejected, 3);
    let rejected: Vec<(&str, String)> = summary
        .rejections
        .iter()
        .map(|r| (r.event_id.as_str(), r.reason.to_string()))
        .collect();
    assert_eq!(rejected[0].0, "neg");
    assert!(rejected[0].1.contains("INVALID_DURATION"));
    assert_eq!(rejected[1].0, "long");
    assert!(rejected[1].1.contains("INVALID_DURATION"));
    assert_eq!(rejected[2].0, "future");
    assert!(rejected[2].1.contains("INVALID_EVENT_TIME"));
    assert_eq!(store.len().await, 3);
    Ok(())
}

#[tokio::test]
async fn last_occurrence_in_batch_wins_and_is_counted_once() -> Result<()> {
    let (store, ingestor, _) = setup();
    let mut invalid_repeat = event("E-1", "M-001", t0(), 7);
    invalid_repeat.duration_ms = None;

    let summary = ingestor
        .ingest_batch_at(
            vec![
                event("E-1", "M-001", t0(), 1),
                event("E-2", "M-001", t0(), 0),
                event("E-1", "M-001", t0(), 3),
                invalid_repeat,
            ],
            t0() + Duration::hours(1),
        )
        .await?;

    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.deduped + summary.updated, 0);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.rejections[0].reason, RejectionReason::NegativeDuration);
    assert_eq!(store.get("E-1").await.expect("stored").content.defect_count, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_defects_count_as_events_only() -> Result<()> {
    let (_, ingestor, stats) = setup();
    ingestor
        .ingest_batch_at(
            vec![
                event("a", "M-001", t0() + Duration::minutes(10), 5),
                event("b", "M-001", t0() + Duration::minutes(20), -1),
                event("c", "M-001", t0() + Duration::minutes(30), 3),
            ],
            t0() + Duration::hours(7),
        )
        .await?;

    let result = stats
        .machine_stats("M-001", t0(), t0() + Duration::hours(6))
        .await?;
    assert_eq!(result.events_count, 3);
    assert_eq!(result.defects_count, 8);
    assert_eq!(result.avg_defect_rate, 1.33);
    assert_eq!(result.status, HealthStatus::Healthy);
    Ok(())
}

#[tokio::test]
async fn window_is_half_open() -> Result<()> {
    let (_, ingestor, stats) = setup();
    let start = t0() + Duration::hours(1);
    let end = t0() + Duration::hours(2);
    ingestor
        .ingest_batch_at(
            vec![
                event("before", "M-001", start - Duration::seconds(1), 1),
                event("at-start", "M-001", start, 1),
                event("inside", "M-001", end - Duration::milliseconds(1), 1),
                event("at-end", "M-001", end, 1),
                event("after", "M-001", end + Duration::seconds(1), 1),
                event("other-machine", "M-002", start, 1),
            ],
            t0() + Duration::hours(3),
        )
        .await?;

    let result = stats.machine_stats("M-001", start, end).await?;
    assert_eq!(result.events_count, 2);
    assert_eq!(result.defects_count, 2);
    assert_eq!(result.avg_defect_rate, 2.0);
    assert_eq!(result.status, HealthStatus::Warning);
    Ok(())
}

#[tokio::test]
async fn empty_or_inverted_window_is_healthy_zero() -> Result<()> {
    let (_, ingestor, stats) = setup();
    ingestor
        .ingest_batch_at(vec![event("a", "M-001", t0(), 50)], t0() + Duration::hours(1))
        .await?;

    for (start, end) in [(t0(), t0()), (t0() + Duration::hours(1), t0())] {
        let result = stats.machine_stats("M-001", start, end).await?;
        assert_eq!((result.events_count, result.defects_count), (0, 0));
        assert_eq!(result.avg_defect_rate, 0.0);
        assert_eq!(result.status, HealthStatus::Healthy);
    }
    Ok(())
}

#[tokio::test]
async fn top_lines_filter_and_rank() -> Result<()> {
    let (_, ingestor, stats) = setup();
    let mut batch = Vec::new();
    let lines = [("L1", 6, 2), ("L2", 4, 1), ("L3", 1, 0)];
    for (line, count, defects) in lines {
        for i in 0..count {
            let mut e = event(&format!("{line}-{i}"), "M-001", t0() + Duration::minutes(i), defects);
            e.line_id = Some(line.to_string());
            batch.push(e);
        }
    }
    let mut unknown = event("unknown", "M-001", t0(), -1);
    unknown.line_id = Some("L3".to_string());
    let mut no_line = event("no-line", "M-001", t0(), 40);
    no_line.line_id = None;
    let mut other_factory = event("other", "M-001", t0(), 40);
    other_factory.factory_id = Some("F02".to_string());
    batch.extend([unknown, no_line, other_factory]);

    ingestor.ingest_batch_at(batch, t0() + Duration::hours(1)).await?;

    let ranked = stats
        .top_defect_lines("F01", t0(), t0() + Duration::hours(1), 2)
        .await?;
    assert_eq!(ranked.len(), 2);
    assert_eq!(ranked[0].line_id, "L1");
    assert_eq!((ranked[0].total_defects, ranked[0].event_count), (12, 6));
    assert_eq!(ranked[0].defects_percent, 200.0);
    assert_eq!(ranked[1].line_id, "L2");
    assert_eq!((ranked[1].total_defects, ranked[1].event_count), (4, 4));

    let all = stats
        .top_defect_lines("F01", t0(), t0() + Duration::hours(1), 10)
        .await?;
    let l3 = all.iter().find(|l| l.line_id == "L3").expect("L3");
    assert_eq!(l3.event_count, 1);
    assert_eq!(l3.total_defects, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_disjoint_batches_all_land() -> Result<()> {
    let (store, ingestor, _) = setup();
    const BATCHES: usize = 8;
    const PER_BATCH: usize = 50;

    let mut tasks = tokio::task::JoinSet::new();
    for b in 0..BATCHES {
        let ingestor = ingestor.clone();
        tasks.spawn(async move {
            let batch: Vec<IncomingEvent> = (0..PER_BATCH)
                .map(|i| event(&format!("B{b}-E{i}"), "M-001", t0(), 1))
                .collect();
            ingestor.ingest_batch_at(batch, t0() + Duration::hours(1)).await
        });
    }

    let mut accepted = 0;
    while let Some(joined) = tasks.join_next().await {
        accepted += joined??.accepted;
    }
    assert_eq!(accepted as usize, BATCHES * PER_BATCH);
    assert_eq!(store.len().await, BATCHES * PER_BATCH);
    Ok(())
}

/// Store wrapper that lets another writer slip in before the first `races` bulk writes.
struct RacingStore {
    inner: MemoryEventStore,
    races: AtomicUsize,
    rival: EventRecord,
}

#[async_trait]
impl EventStore for RacingStore {
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, EventRecord>, StoreError> {
        self.inner.find_by_ids(ids).await
    }

    async fn bulk_upsert(&self, writes: Vec<StoreWrite>) -> Result<WriteReport, StoreError> {
        if self.races.load(Ordering::SeqCst) > 0 {
            self.races.fetch_sub(1, Ordering::SeqCst);
            let mut rival = self.rival.clone();
            if let Some(current) = self.inner.get(&rival.event_id).await {
                rival.version = current.version + 1;
            }
            self.inner.put(rival).await;
        }
        self.inner.bulk_upsert(writes).await
    }

    async fn count_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.inner.count_in_window(machine_id, start, end).await
    }

    async fn sum_defects_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.inner.sum_defects_in_window(machine_id, start, end).await
    }

    async fn group_defects_by_line(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<super::types::LineDefectTotals>, StoreError> {
        self.inner.group_defects_by_line(factory_id, from, to).await
    }
}

fn rival_record(received_time: DateTime<Utc>) -> EventRecord {
    let valid = super::validate::validate(&event("E-1", "M-009", t0(), 4), received_time)
        .expect("valid rival");
    let fingerprint = super::fingerprint::fingerprint(&valid.content);
    EventRecord {
        event_id: valid.event_id,
        content: valid.content,
        received_time,
        fingerprint,
        version: 0,
    }
}

#[tokio::test]
async fn lost_insert_race_is_retried_against_fresh_snapshot() -> Result<()> {
    let now = t0() + Duration::hours(2);
    let store = Arc::new(RacingStore {
        inner: MemoryEventStore::new(),
        races: AtomicUsize::new(1),
        rival: rival_record(t0() + Duration::hours(1)),
    });
    let ingestor = BatchIngestor::new(store.clone());

    let summary = ingestor
        .ingest_batch_at(
            vec![event("E-1", "M-001", t0(), 1), event("E-2", "M-001", t0(), 1)],
            now,
        )
        .await?;

    // E-1 lost the insert race to an older receipt, so the retry overwrites it.
    assert_eq!((summary.accepted, summary.updated, summary.deduped), (1, 1, 0));
    let stored = store.inner.get("E-1").await.expect("stored");
    assert_eq!(stored.content.machine_id, "M-001");
    assert_eq!(stored.received_time, now);
    assert_eq!(store.inner.len().await, 2);
    Ok(())
}

#[tokio::test]
async fn persistent_conflict_surfaces_after_one_retry() {
    let store = Arc::new(RacingStore {
        inner: MemoryEventStore::new(),
        races: AtomicUsize::new(2),
        rival: rival_record(t0() + Duration::hours(1)),
    });
    let ingestor = BatchIngestor::new(store);

    let err = ingestor
        .ingest_batch_at(vec![event("E-1", "M-001", t0(), 1)], t0() + Duration::hours(2))
        .await
        .unwrap_err();
    match err {
        IngestError::Conflict { ids } => assert_eq!(ids, vec!["E-1".to_string()]),
        other => panic!("expected conflict, got {other:?}"),
    }
}
