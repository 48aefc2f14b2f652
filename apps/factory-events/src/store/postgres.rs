use super::{EventStore, StoreError, StoreWrite, WriteReport};
use crate::events::types::{EventContent, EventRecord, LineDefectTotals, UNKNOWN_DEFECT_COUNT};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// 10 binds per row keeps each statement well under the 65535 parameter limit.
const INSERT_CHUNK_ROWS: usize = 5_000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS machine_events (
        event_id text PRIMARY KEY,
        event_time timestamptz NOT NULL,
        received_time timestamptz NOT NULL,
        machine_id text NOT NULL,
        duration_ms bigint NOT NULL,
        defect_count integer NOT NULL,
        factory_id text NULL,
        line_id text NULL,
        fingerprint text NOT NULL,
        version bigint NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_machine_events_machine_time ON machine_events (machine_id, event_time)",
    "CREATE INDEX IF NOT EXISTS idx_machine_events_event_time ON machine_events (event_time)",
    "CREATE INDEX IF NOT EXISTS idx_machine_events_factory_line_time ON machine_events (factory_id, line_id, event_time)",
];

pub async fn build_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .context("failed to connect to event database")
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<EventRecord, sqlx::Error> {
    Ok(EventRecord {
        event_id: row.try_get("event_id")?,
        content: EventContent {
            event_time: row.try_get("event_time")?,
            machine_id: row.try_get("machine_id")?,
            duration_ms: row.try_get("duration_ms")?,
            defect_count: row.try_get("defect_count")?,
            factory_id: row.try_get("factory_id")?,
            line_id: row.try_get("line_id")?,
        },
        received_time: row.try_get("received_time")?,
        fingerprint: row.try_get("fingerprint")?,
        version: row.try_get("version")?,
    })
}

impl PgEventStore {
    /// Applies inserts then conditional updates in one transaction. Any error rolls it back.
    async fn write_in_transaction(
        &self,
        inserts: &[EventRecord],
        updates: &[(EventRecord, i64)],
    ) -> Result<WriteReport, sqlx::Error> {
        let mut report = WriteReport::default();
        let mut tx = self.pool.begin().await?;

        for chunk in inserts.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO machine_events (event_id, event_time, received_time, machine_id, \
                 duration_ms, defect_count, factory_id, line_id, fingerprint, version) ",
            );
            builder.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(&record.event_id)
                    .push_bind(record.content.event_time)
                    .push_bind(record.received_time)
                    .push_bind(&record.content.machine_id)
                    .push_bind(record.content.duration_ms)
                    .push_bind(record.content.defect_count)
                    .push_bind(&record.content.factory_id)
                    .push_bind(&record.content.line_id)
                    .push_bind(&record.fingerprint)
                    .push_bind(record.version);
            });
            builder.push(" ON CONFLICT (event_id) DO NOTHING RETURNING event_id");

            let inserted: HashSet<String> = builder
                .build()
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| row.try_get::<String, _>("event_id"))
                .collect::<Result<_, _>>()?;

            report.inserted += inserted.len() as u64;
            report.conflicts.extend(
                chunk
                    .iter()
                    .filter(|record| !inserted.contains(&record.event_id))
                    .map(|record| record.event_id.clone()),
            );
        }

        for (record, expected_version) in updates {
            let result = sqlx::query(
                r#"
                UPDATE machine_events
                SET event_time = $2,
                    received_time = $3,
                    machine_id = $4,
                    duration_ms = $5,
                    defect_count = $6,
                    factory_id = $7,
                    line_id = $8,
                    fingerprint = $9,
                    version = $10
                WHERE event_id = $1
                  AND version = $11
                "#,
            )
            .bind(&record.event_id)
            .bind(record.content.event_time)
            .bind(record.received_time)
            .bind(&record.content.machine_id)
            .bind(record.content.duration_ms)
            .bind(record.content.defect_count)
            .bind(&record.content.factory_id)
            .bind(&record.content.line_id)
            .bind(&record.fingerprint)
            .bind(record.version)
            .bind(expected_version)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                report.conflicts.push(record.event_id.clone());
            } else {
                report.updated += 1;
            }
        }

        tx.commit().await?;
        Ok(report)
    }
}

/// Deadlock and serialization failures abort the whole transaction; the writes can be retried.
fn is_lock_contention(code: Option<&str>) -> bool {
    matches!(code, Some("40P01") | Some("40001"))
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, EventRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_time, received_time, machine_id, duration_ms,
                   defect_count, factory_id, line_id, fingerprint, version
            FROM machine_events
            WHERE event_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            found.insert(record.event_id.clone(), record);
        }
        Ok(found)
    }

    async fn bulk_upsert(&self, writes: Vec<StoreWrite>) -> Result<WriteReport, StoreError> {
        if writes.is_empty() {
            return Ok(WriteReport::default());
        }

        let mut inserts: Vec<EventRecord> = Vec::new();
        let mut updates: Vec<(EventRecord, i64)> = Vec::new();
        for write in writes {
            match write {
                StoreWrite::Insert(record) => inserts.push(record),
                StoreWrite::Update {
                    record,
                    expected_version,
                } => updates.push((record, expected_version)),
            }
        }
        // Concurrent batches must take row locks in the same order.
        inserts.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        updates.sort_by(|(a, _), (b, _)| a.event_id.cmp(&b.event_id));

        let report = match self.write_in_transaction(&inserts, &updates).await {
            Ok(report) => report,
            Err(sqlx::Error::Database(db_err))
                if is_lock_contention(db_err.code().as_deref()) =>
            {
                tracing::debug!(
                    code = ?db_err.code(),
                    writes = inserts.len() + updates.len(),
                    "bulk write rolled back by lock contention"
                );
                WriteReport {
                    inserted: 0,
                    updated: 0,
                    conflicts: inserts
                        .iter()
                        .chain(updates.iter().map(|(record, _)| record))
                        .map(|record| record.event_id.clone())
                        .collect(),
                }
            }
            Err(err) => return Err(err.into()),
        };

        if !report.conflicts.is_empty() {
            tracing::debug!(
                conflicts = report.conflicts.len(),
                "conditional writes lost to concurrent writers"
            );
        }
        Ok(report)
    }

    async fn count_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM machine_events
            WHERE machine_id = $1
              AND event_time >= $2
              AND event_time < $3
            "#,
        )
        .bind(machine_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn sum_defects_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(defect_count), 0)::bigint
            FROM machine_events
            WHERE machine_id = $1
              AND event_time >= $2
              AND event_time < $3
              AND defect_count > $4
            "#,
        )
        .bind(machine_id)
        .bind(start)
        .bind(end)
        .bind(UNKNOWN_DEFECT_COUNT)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn group_defects_by_line(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LineDefectTotals>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT line_id,
                   SUM(defect_count)::bigint AS total_defects,
                   COUNT(*) AS event_count
            FROM machine_events
            WHERE factory_id = $1
              AND event_time >= $2
              AND event_time < $3
              AND defect_count > $4
              AND line_id IS NOT NULL
            GROUP BY line_id
            ORDER BY total_defects DESC, line_id ASC
            "#,
        )
        .bind(factory_id)
        .bind(from)
        .bind(to)
        .bind(UNKNOWN_DEFECT_COUNT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<LineDefectTotals, StoreError> {
                Ok(LineDefectTotals {
                    line_id: row.try_get("line_id")?,
                    total_defects: row.try_get("total_defects")?,
                    event_count: row.try_get("event_count")?,
                })
            })
            .collect()
    }
}
