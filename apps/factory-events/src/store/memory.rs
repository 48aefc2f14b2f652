use super::{EventStore, StoreError, StoreWrite, WriteReport};
use crate::events::types::{EventRecord, LineDefectTotals};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Process-local store with the same conditional-write semantics as the postgres store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    rows: RwLock<HashMap<String, EventRecord>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, event_id: &str) -> Option<EventRecord> {
        self.rows.read().await.get(event_id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Writes a row as-is, bypassing reconciliation. For seeding and simulating other writers.
    #[cfg(test)]
    pub(crate) async fn put(&self, record: EventRecord) {
        self.rows
            .write()
            .await
            .insert(record.event_id.clone(), record);
    }
}

fn in_window(ts: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    ts >= start && ts < end
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, EventRecord>, StoreError> {
        let rows = self.rows.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id).map(|row| (id.clone(), row.clone())))
            .collect())
    }

    async fn bulk_upsert(&self, writes: Vec<StoreWrite>) -> Result<WriteReport, StoreError> {
        let mut rows = self.rows.write().await;
        let mut report = WriteReport::default();
        for write in writes {
            match write {
                StoreWrite::Insert(record) => {
                    if rows.contains_key(&record.event_id) {
                        report.conflicts.push(record.event_id);
                    } else {
                        rows.insert(record.event_id.clone(), record);
                        report.inserted += 1;
                    }
                }
                StoreWrite::Update {
                    record,
                    expected_version,
                } => match rows.get_mut(&record.event_id) {
                    Some(current) if current.version == expected_version => {
                        *current = record;
                        report.updated += 1;
                    }
                    _ => report.conflicts.push(record.event_id),
                },
            }
        }
        Ok(report)
    }

    async fn count_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let rows = self.rows.read().await;
        let count = rows
            .values()
            .filter(|row| row.content.machine_id == machine_id)
            .filter(|row| in_window(row.content.event_time, start, end))
            .count();
        Ok(count as i64)
    }

    async fn sum_defects_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| row.content.machine_id == machine_id)
            .filter(|row| in_window(row.content.event_time, start, end))
            .filter(|row| row.content.has_known_defects())
            .map(|row| i64::from(row.content.defect_count))
            .sum())
    }

    async fn group_defects_by_line(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LineDefectTotals>, StoreError> {
        let rows = self.rows.read().await;
        let mut grouped: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for row in rows.values() {
            let content = &row.content;
            let Some(line_id) = content.line_id.as_deref() else {
                continue;
            };
            if content.factory_id.as_deref() != Some(factory_id)
                || !in_window(content.event_time, from, to)
                || !content.has_known_defects()
            {
                continue;
            }
            let entry = grouped.entry(line_id).or_default();
            entry.0 += i64::from(content.defect_count);
            entry.1 += 1;
        }
        Ok(grouped
            .into_iter()
            .map(|(line_id, (total_defects, event_count))| LineDefectTotals {
                line_id: line_id.to_string(),
                total_defects,
                event_count,
            })
            .collect())
    }
}
