//! Hourly trace statistics.
//!
//! Aggregates trace events (from the in-memory recorder or the persisted
//! `trace_events` table) into per-hour, per-stage counts and average
//! durations. Used by `ragline traces --hourly`.

use std::collections::BTreeMap;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;

use ragline_core::trace::{TraceEvent, TracePayload, TraceStage};

/// Aggregate for one stage within one hour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyBucket {
    /// Start of the hour (UTC).
    pub hour: DateTime<Utc>,
    pub stage: TraceStage,
    pub count: usize,
    /// Mean over events that carry a duration.
    pub avg_duration_ms: Option<f64>,
    /// Retrieval events that returned no results.
    pub empty_results: usize,
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    timed: usize,
    total_ms: u64,
    empty_results: usize,
}

/// Buckets ordered by hour, then stage.
pub fn hourly_buckets(events: &[TraceEvent]) -> Vec<HourlyBucket> {
    let mut buckets: BTreeMap<(DateTime<Utc>, TraceStage), Accumulator> = BTreeMap::new();
    for event in events {
        let hour = event
            .timestamp
            .duration_trunc(TimeDelta::hours(1))
            .unwrap_or(event.timestamp);
        let acc = buckets.entry((hour, event.stage())).or_default();
        acc.count += 1;
        if let Some(ms) = event.duration_ms {
            acc.timed += 1;
            acc.total_ms = acc.total_ms.saturating_add(ms);
        }
        if let TracePayload::Retrieval(summary) = &event.payload {
            if summary.empty_result {
                acc.empty_results += 1;
            }
        }
    }

    buckets
        .into_iter()
        .map(|((hour, stage), acc)| HourlyBucket {
            hour,
            stage,
            count: acc.count,
            avg_duration_ms: (acc.timed > 0).then(|| acc.total_ms as f64 / acc.timed as f64),
            empty_results: acc.empty_results,
        })
        .collect()
}

pub fn print_hourly(buckets: &[HourlyBucket]) {
    if buckets.is_empty() {
        println!("No trace events.");
        return;
    }
    println!(
        "{:<17}  {:<16}  {:>6}  {:>10}  {:>6}",
        "HOUR", "STAGE", "COUNT", "AVG MS", "EMPTY"
    );
    for b in buckets {
        let avg = b
            .avg_duration_ms
            .map(|ms| format!("{:.1}", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<17}  {:<16}  {:>6}  {:>10}  {:>6}",
            b.hour.format("%Y-%m-%d %H:00"),
            b.stage.as_str(),
            b.count,
            avg,
            b.empty_results
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ragline_core::models::{MatchStats, Scope};
    use ragline_core::trace::RetrievalSummary;

    fn at(h: u32, m: u32, payload: TracePayload, duration_ms: Option<u64>) -> TraceEvent {
        TraceEvent {
            correlation_id: "c".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap(),
            duration_ms,
            payload,
        }
    }

    fn retrieval(empty: bool) -> TracePayload {
        TracePayload::Retrieval(RetrievalSummary {
            scope: Scope::Unscoped,
            result_count: if empty { 0 } else { 1 },
            match_stats: MatchStats::default(),
            scores: None,
            empty_result: empty,
            degradations: Vec::new(),
        })
    }

    #[test]
    fn test_groups_by_hour_and_stage() {
        let events = vec![
            at(9, 5, retrieval(false), Some(10)),
            at(9, 55, retrieval(true), Some(30)),
            at(10, 1, retrieval(false), None),
            at(
                9,
                30,
                TracePayload::Cancelled {
                    operation: "ingest".into(),
                },
                None,
            ),
        ];
        let buckets = hourly_buckets(&events);
        assert_eq!(buckets.len(), 3);

        let nine = &buckets[0];
        assert_eq!(nine.stage, TraceStage::Retrieval);
        assert_eq!(nine.count, 2);
        assert_eq!(nine.avg_duration_ms, Some(20.0));
        assert_eq!(nine.empty_results, 1);

        assert_eq!(buckets[1].stage, TraceStage::Cancelled);
        assert_eq!(buckets[2].hour, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap());
        assert_eq!(buckets[2].avg_duration_ms, None);
    }

    #[test]
    fn test_empty_input() {
        assert!(hourly_buckets(&[]).is_empty());
    }
}
