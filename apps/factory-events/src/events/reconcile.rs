use super::fingerprint::fingerprint;
use super::types::{EventContent, EventRecord, ValidEvent};
use chrono::{DateTime, Utc};

/// A validated event together with its content fingerprint.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub event_id: String,
    pub content: EventContent,
    pub fingerprint: String,
}

impl From<ValidEvent> for Candidate {
    fn from(event: ValidEvent) -> Self {
        let fingerprint = fingerprint(&event.content);
        Self {
            event_id: event.event_id,
            content: event.content,
            fingerprint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeReason {
    SameContent,
    /// Conflicting content, but the stored row was received at or after this batch.
    StaleArrival,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept(EventRecord),
    Update {
        record: EventRecord,
        expected_version: i64,
    },
    Dedupe(DedupeReason),
}

pub fn reconcile(
    candidate: &Candidate,
    now: DateTime<Utc>,
    existing: Option<&EventRecord>,
) -> Decision {
    let Some(stored) = existing else {
        return Decision::Accept(EventRecord {
            event_id: candidate.event_id.clone(),
            content: candidate.content.clone(),
            received_time: now,
            fingerprint: candidate.fingerprint.clone(),
            version: 0,
        });
    };

    if stored.fingerprint == candidate.fingerprint {
        return Decision::Dedupe(DedupeReason::SameContent);
    }
    if now <= stored.received_time {
        return Decision::Dedupe(DedupeReason::StaleArrival);
    }

    Decision::Update {
        record: EventRecord {
            event_id: stored.event_id.clone(),
            content: candidate.content.clone(),
            received_time: now,
            fingerprint: candidate.fingerprint.clone(),
            version: stored.version + 1,
        },
        expected_version: stored.version,
    }
}
