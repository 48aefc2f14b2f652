use super::types::{EventContent, IncomingEvent, Rejection, RejectionReason, ValidEvent};
use super::{MAX_DURATION_MS, MAX_FUTURE_SKEW_MINUTES};
use chrono::{DateTime, Duration, Utc};

/// Checks one event against the ingest rules, in order, stopping at the first failure.
pub fn validate(event: &IncomingEvent, now: DateTime<Utc>) -> Result<ValidEvent, Rejection> {
    let reject = |reason| Rejection {
        event_id: event.event_id.clone(),
        reason,
    };

    let duration_ms = match event.duration_ms {
        Some(ms) if ms >= 0 => ms,
        _ => return Err(reject(RejectionReason::NegativeDuration)),
    };
    if duration_ms > MAX_DURATION_MS {
        return Err(reject(RejectionReason::DurationTooLong));
    }

    let event_time = event
        .event_time
        .ok_or_else(|| reject(RejectionReason::MissingEventTime))?;
    if event_time > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
        return Err(reject(RejectionReason::EventTimeInFuture));
    }

    Ok(ValidEvent {
        event_id: event.event_id.clone(),
        content: EventContent {
            event_time,
            machine_id: event.machine_id.clone(),
            duration_ms,
            defect_count: event.defect_count,
            factory_id: event.factory_id.clone(),
            line_id: event.line_id.clone(),
        },
    })
}
