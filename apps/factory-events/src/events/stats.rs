use super::types::{HealthStatus, LineDefectTotals, LineDefects, MachineStats};
use super::WARNING_DEFECT_RATE;
use crate::store::{EventStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub const DEFAULT_TOP_LINES_LIMIT: usize = 10;

/// Rounds to two decimals with halves going up, e.g. `1.775 -> 1.78`.
pub fn round_half_up_2(value: f64) -> f64 {
    (value * 100.0 + 0.5).floor() / 100.0
}

/// Defects per hour over a window measured in whole seconds. Empty or inverted windows rate 0.
fn defects_per_hour(defects: i64, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let window_hours = (end - start).num_seconds() as f64 / 3600.0;
    if window_hours > 0.0 {
        defects as f64 / window_hours
    } else {
        0.0
    }
}

impl HealthStatus {
    pub fn classify(defects_per_hour: f64) -> Self {
        if defects_per_hour < WARNING_DEFECT_RATE {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        }
    }
}

/// Orders lines by total defects, highest first, ties by line id, and keeps the first `limit`.
pub fn rank_lines(mut groups: Vec<LineDefectTotals>, limit: usize) -> Vec<LineDefects> {
    groups.sort_by(|a, b| {
        b.total_defects
            .cmp(&a.total_defects)
            .then_with(|| a.line_id.cmp(&b.line_id))
    });
    groups
        .into_iter()
        .take(limit)
        .map(|group| {
            let defects_percent = if group.event_count > 0 {
                round_half_up_2(group.total_defects as f64 * 100.0 / group.event_count as f64)
            } else {
                0.0
            };
            LineDefects {
                line_id: group.line_id,
                total_defects: group.total_defects,
                event_count: group.event_count,
                defects_percent,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct StatsService {
    store: Arc<dyn EventStore>,
}

impl StatsService {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn machine_stats(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MachineStats, StoreError> {
        let (events_count, defects_count) = if start < end {
            let events = self.store.count_in_window(machine_id, start, end).await?;
            let defects = self
                .store
                .sum_defects_in_window(machine_id, start, end)
                .await?;
            (events, defects)
        } else {
            (0, 0)
        };

        // Status is classified on the unrounded rate.
        let rate = defects_per_hour(defects_count, start, end);
        Ok(MachineStats {
            machine_id: machine_id.to_string(),
            start,
            end,
            events_count,
            defects_count,
            avg_defect_rate: round_half_up_2(rate),
            status: HealthStatus::classify(rate),
        })
    }

    pub async fn top_defect_lines(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LineDefects>, StoreError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let groups = self.store.group_defects_by_line(factory_id, from, to).await?;
        Ok(rank_lines(groups, limit))
    }
}
