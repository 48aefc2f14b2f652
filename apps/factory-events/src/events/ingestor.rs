use super::reconcile::{reconcile, Candidate, Decision, DedupeReason};
use super::types::{IncomingEvent, IngestSummary, ValidEvent};
use super::validate::validate;
use crate::store::{EventStore, StoreError, StoreWrite};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// Refreshed-snapshot retries after a conditional write loses to a concurrent batch.
const CONFLICT_RETRIES: usize = 1;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{} event(s) still conflicting with concurrent writers after retry", ids.len())]
    Conflict { ids: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Accepted,
    Updated,
    Deduped,
}

#[derive(Clone)]
pub struct BatchIngestor {
    store: Arc<dyn EventStore>,
}

impl BatchIngestor {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn ingest_batch(&self, events: Vec<IncomingEvent>) -> Result<IngestSummary, IngestError> {
        self.ingest_batch_at(events, Utc::now()).await
    }

    /// Ingests a batch using `now` as both the future-time cutoff and the receipt time of every
    /// write.
    pub async fn ingest_batch_at(
        &self,
        events: Vec<IncomingEvent>,
        now: DateTime<Utc>,
    ) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();
        if events.is_empty() {
            return Ok(summary);
        }

        let mut survivors: Vec<ValidEvent> = Vec::with_capacity(events.len());
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(events.len());
        let mut superseded = 0usize;
        for event in &events {
            match validate(event, now) {
                Ok(valid) => match positions.get(&valid.event_id) {
                    // Last occurrence wins but keeps the slot of the first.
                    Some(&idx) => {
                        survivors[idx] = valid;
                        superseded += 1;
                    }
                    None => {
                        positions.insert(valid.event_id.clone(), survivors.len());
                        survivors.push(valid);
                    }
                },
                Err(rejection) => summary.rejections.push(rejection),
            }
        }
        summary.rejected = summary.rejections.len() as u64;

        let mut pending: Vec<Candidate> = survivors.into_iter().map(Candidate::from).collect();
        let mut attempt = 0;
        while !pending.is_empty() {
            let (outcomes, conflicts) = self.reconcile_and_write(&pending, now).await?;

            for (event_id, outcome) in &outcomes {
                if conflicts.contains(event_id) {
                    continue;
                }
                match outcome {
                    Outcome::Accepted => summary.accepted += 1,
                    Outcome::Updated => summary.updated += 1,
                    Outcome::Deduped => summary.deduped += 1,
                }
            }

            if conflicts.is_empty() {
                break;
            }
            if attempt >= CONFLICT_RETRIES {
                let mut ids: Vec<String> = conflicts.into_iter().collect();
                ids.sort();
                tracing::warn!(conflicts = ids.len(), "giving up on conflicting events");
                return Err(IngestError::Conflict { ids });
            }
            attempt += 1;
            tracing::debug!(
                conflicts = conflicts.len(),
                attempt,
                "retrying conflicting events with refreshed snapshot"
            );
            pending.retain(|candidate| conflicts.contains(&candidate.event_id));
        }

        tracing::info!(
            received = events.len(),
            accepted = summary.accepted,
            deduped = summary.deduped,
            updated = summary.updated,
            rejected = summary.rejected,
            superseded,
            "batch processed"
        );
        Ok(summary)
    }

    /// One lookup, one reconciliation pass and one bulk write over `candidates`.
    async fn reconcile_and_write(
        &self,
        candidates: &[Candidate],
        now: DateTime<Utc>,
    ) -> Result<(Vec<(String, Outcome)>, HashSet<String>), StoreError> {
        let ids: Vec<String> = candidates.iter().map(|c| c.event_id.clone()).collect();
        let existing = self.store.find_by_ids(&ids).await?;

        let mut outcomes = Vec::with_capacity(candidates.len());
        let mut writes = Vec::new();
        for candidate in candidates {
            let outcome = match reconcile(candidate, now, existing.get(&candidate.event_id)) {
                Decision::Accept(record) => {
                    writes.push(StoreWrite::Insert(record));
                    Outcome::Accepted
                }
                Decision::Update {
                    record,
                    expected_version,
                } => {
                    writes.push(StoreWrite::Update {
                        record,
                        expected_version,
                    });
                    Outcome::Updated
                }
                Decision::Dedupe(reason) => {
                    if reason == DedupeReason::StaleArrival {
                        tracing::debug!(
                            event_id = %candidate.event_id,
                            "ignoring conflicting content older than stored receipt"
                        );
                    }
                    Outcome::Deduped
                }
            };
            outcomes.push((candidate.event_id.clone(), outcome));
        }

        if writes.is_empty() {
            return Ok((outcomes, HashSet::new()));
        }
        let report = self.store.bulk_upsert(writes).await?;
        Ok((outcomes, report.conflicts.into_iter().collect()))
    }
}
