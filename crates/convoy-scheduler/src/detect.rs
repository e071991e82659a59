//! Pure detection helpers: batch-time rounding and row grouping
//!
//! Kept free of I/O so the grouping semantics are unit-testable without a
//! database or a live data source.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use convoy_core::{BatchTimeMode, DataSourceDef};
use convoy_datasource::SourceRow;

/// Round to the nearest 5-minute boundary (immediate-mode batch time)
pub fn round_to_nearest_5m(now: DateTime<Utc>) -> DateTime<Utc> {
    let ts = now.timestamp();
    let rounded = ((ts + 150) / 300) * 300;
    Utc.timestamp_opt(rounded, 0).single().unwrap_or(now)
}

/// Parse a batch-time column value: RFC 3339 first, then the common
/// `YYYY-MM-DD HH:MM:SS` form (interpreted as UTC).
pub fn parse_batch_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Group query rows into (batch start time, rows).
///
/// Immediate runbooks produce at most one group at the rounded "now";
/// rows whose primary key is already active in an unfinished batch are
/// filtered out. Column-timed runbooks group by the parsed column value;
/// rows with a missing or unparseable time are dropped with a warning.
pub fn group_rows(
    def: &DataSourceDef,
    rows: Vec<SourceRow>,
    now: DateTime<Utc>,
    active_keys: &HashSet<String>,
) -> BTreeMap<DateTime<Utc>, Vec<SourceRow>> {
    let mut groups: BTreeMap<DateTime<Utc>, Vec<SourceRow>> = BTreeMap::new();

    match &def.batch_time {
        BatchTimeMode::Immediate => {
            let start = round_to_nearest_5m(now);
            let fresh: Vec<SourceRow> = rows
                .into_iter()
                .filter(|row| match row.get_str(&def.primary_key) {
                    Some(key) => !active_keys.contains(&key),
                    None => {
                        warn!(primary_key = %def.primary_key, "row missing primary key, dropped");
                        false
                    }
                })
                .collect();
            if !fresh.is_empty() {
                groups.insert(start, fresh);
            }
        }
        BatchTimeMode::Column(column) => {
            for row in rows {
                let Some(raw) = row.get_str(column) else {
                    warn!(column = %column, "row missing batch time column, dropped");
                    continue;
                };
                let Some(start) = parse_batch_time(&raw) else {
                    warn!(column = %column, value = %raw, "unparseable batch time, dropped");
                    continue;
                };
                groups.entry(start).or_default().push(row);
            }
        }
    }

    groups
}
