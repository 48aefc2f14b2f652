pub mod fingerprint;
mod ingestor;
pub mod reconcile;
mod stats;
pub mod types;
pub mod validate;

#[cfg(test)]
mod tests;

pub use ingestor::{BatchIngestor, IngestError};
pub use stats::{rank_lines, round_half_up_2, StatsService, DEFAULT_TOP_LINES_LIMIT};

/// Six hours.
pub const MAX_DURATION_MS: i64 = 6 * 60 * 60 * 1000;
pub const MAX_FUTURE_SKEW_MINUTES: i64 = 15;
/// Defects per hour at which a machine is reported as `Warning`.
pub const WARNING_DEFECT_RATE: f64 = 2.0;
