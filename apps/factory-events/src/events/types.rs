use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// `defectCount` value reported by machines that could not count defects.
pub const UNKNOWN_DEFECT_COUNT: i32 = -1;

/// One event as submitted by a client. Presence of `eventTime` and `durationMs` is checked by the
/// validator rather than by deserialization so that a missing value becomes a per-item rejection
/// instead of failing the whole batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingEvent {
    pub event_id: String,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    pub machine_id: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub defect_count: i32,
    #[serde(default)]
    pub factory_id: Option<String>,
    #[serde(default)]
    pub line_id: Option<String>,
}

/// The fields covered by the fingerprint. Everything about an event except its identity and the
/// server-side bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContent {
    pub event_time: DateTime<Utc>,
    pub machine_id: String,
    pub duration_ms: i64,
    pub defect_count: i32,
    pub factory_id: Option<String>,
    pub line_id: Option<String>,
}

impl EventContent {
    pub fn has_known_defects(&self) -> bool {
        self.defect_count >= 0
    }
}

/// An event that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidEvent {
    pub event_id: String,
    pub content: EventContent,
}

/// A stored event row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_id: String,
    pub content: EventContent,
    pub received_time: DateTime<Utc>,
    pub fingerprint: String,
    /// Optimistic concurrency token; 0 on insert, bumped by every update.
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NegativeDuration,
    DurationTooLong,
    MissingEventTime,
    EventTimeInFuture,
}

impl RejectionReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectionReason::NegativeDuration | RejectionReason::DurationTooLong => {
                "INVALID_DURATION"
            }
            RejectionReason::MissingEventTime | RejectionReason::EventTimeInFuture => {
                "INVALID_EVENT_TIME"
            }
        }
    }

    fn detail(self) -> &'static str {
        match self {
            RejectionReason::NegativeDuration => "durationMs must be >= 0",
            RejectionReason::DurationTooLong => "durationMs exceeds 6 hours",
            RejectionReason::MissingEventTime => "eventTime is required",
            RejectionReason::EventTimeInFuture => {
                "eventTime is more than 15 minutes in the future"
            }
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.detail())
    }
}

impl Serialize for RejectionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub event_id: String,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub accepted: u64,
    pub deduped: u64,
    pub updated: u64,
    pub rejected: u64,
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStats {
    pub machine_id: String,
    #[serde(serialize_with = "serialize_instant")]
    pub start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_instant")]
    pub end: DateTime<Utc>,
    pub events_count: i64,
    pub defects_count: i64,
    pub avg_defect_rate: f64,
    pub status: HealthStatus,
}

/// Per-line aggregate as returned by the store, before ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDefectTotals {
    pub line_id: String,
    pub total_defects: i64,
    pub event_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineDefects {
    pub line_id: String,
    pub total_defects: i64,
    pub event_count: i64,
    pub defects_percent: f64,
}

/// Wire format for instants: UTC, millisecond precision, `Z` suffix.
pub fn format_instant(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn serialize_instant<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_instant(ts))
}
