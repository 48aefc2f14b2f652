mod memory;
mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::{build_pool, PgEventStore};

use crate::config::{Config, StoreBackend};
use crate::events::types::{EventRecord, LineDefectTotals};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    /// Insert only if no row with this id exists yet.
    Insert(EventRecord),
    /// Overwrite only if the stored row still carries `expected_version`.
    Update {
        record: EventRecord,
        expected_version: i64,
    },
}

/// Result of a bulk write. Each write is applied or refused on its own; `conflicts` lists the ids
/// whose conditional write lost to a concurrent writer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub inserted: u64,
    pub updated: u64,
    pub conflicts: Vec<String>,
}

/// Durable keyed event storage. Windows are half-open over `event_time`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, EventRecord>, StoreError>;

    async fn bulk_upsert(&self, writes: Vec<StoreWrite>) -> Result<WriteReport, StoreError>;

    async fn count_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Sum of `defect_count`, skipping rows with an unknown count.
    async fn sum_defects_in_window(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Per-line totals over rows with a known defect count and a non-null line.
    async fn group_defects_by_line(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LineDefectTotals>, StoreError>;
}

pub async fn connect(config: &Config) -> Result<Arc<dyn EventStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory event store; events are lost on restart");
            Ok(Arc::new(MemoryEventStore::new()))
        }
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("FACTORY_EVENTS_DATABASE_URL or DATABASE_URL is required for the postgres store")?;
            let pool = build_pool(
                database_url,
                config.db_pool_size,
                config.db_acquire_timeout,
            )
            .await?;
            let store = PgEventStore::new(pool);
            store
                .ensure_schema()
                .await
                .context("failed to bootstrap machine_events table")?;
            Ok(Arc::new(store))
        }
    }
}
