//! Activity windows and hourly session buckets.
//!
//! Both are stored as strings in encounter metadata:
//! - activity log: `start,end;start,end` (unix seconds)
//! - session history: `YYYY-MM-DD-HH;YYYY-MM-DD-HH` (UTC)

use crate::types::ActivityLogEntry;

/// Two sightings closer than this belong to the same activity window.
pub const ACTIVITY_GAP_SEC: f64 = 120.0;

/// Extend the last window if `now` is within the gap, else open a new one.
///
/// Returns true when an existing window was extended.
pub fn record_activity(entries: &mut Vec<ActivityLogEntry>, now: f64) -> bool {
    if let Some(last) = entries.last_mut() {
        if now - last.end_time <= ACTIVITY_GAP_SEC && now >= last.start_time {
            if now > last.end_time {
                last.end_time = now;
            }
            return true;
        }
    }
    entries.push(ActivityLogEntry {
        start_time: now,
        end_time: now,
    });
    false
}

/// Parse the metadata form. Malformed entries are skipped.
pub fn parse_activity_log(text: &str) -> Vec<ActivityLogEntry> {
    text.split(';')
        .filter_map(|entry| {
            let (start, end) = entry.trim().split_once(',')?;
            let start_time = start.trim().parse::<f64>().ok()?;
            let end_time = end.trim().parse::<f64>().ok()?;
            Some(ActivityLogEntry {
                start_time,
                end_time: end_time.max(start_time),
            })
        })
        .collect()
}

pub fn format_activity_log(entries: &[ActivityLogEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{:.3},{:.3}", e.start_time, e.end_time))
        .collect::<Vec<_>>()
        .join(";")
}

/// Total observed transmission time across all windows.
pub fn total_active_seconds(entries: &[ActivityLogEntry]) -> f64 {
    entries.iter().map(|e| e.end_time - e.start_time).sum()
}

/// Append `bucket` to a `;`-delimited history if it is not already present.
///
/// Returns the updated history, or `None` when nothing changed.
pub fn append_session_bucket(history: Option<&str>, bucket: &str) -> Option<String> {
    let history = history.unwrap_or("");
    if history.split(';').any(|b| b == bucket) {
        return None;
    }
    if history.is_empty() {
        Some(bucket.to_string())
    } else {
        Some(format!("{history};{bucket}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
