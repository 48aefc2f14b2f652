use super::types::EventContent;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

/// SHA-256 over the content fields, base64 encoded (44 chars).
///
/// The payload layout is persisted implicitly through stored fingerprints: changing it turns every
/// resubmitted event into an update.
pub fn fingerprint(content: &EventContent) -> String {
    let payload = format!(
        "{}|{}|{}|{}|{}|{}",
        content
            .event_time
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        content.machine_id,
        content.duration_ms,
        content.defect_count,
        content.factory_id.as_deref().unwrap_or(""),
        content.line_id.as_deref().unwrap_or(""),
    );
    let digest = Sha256::digest(payload.as_bytes());
    STANDARD.encode(digest)
}
