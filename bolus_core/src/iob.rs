//! Insulin on board.
//!
//! Rapid-acting doses decay linearly from their full amount at the moment of
//! injection to zero at exactly `active_insulin_hours`. Basal entries never
//! contribute.

use crate::calculator::round_to_tenth;
use crate::InsulinEntry;
use chrono::{DateTime, Duration, Utc};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Start of the window of entries that can still contribute at `now`
pub fn iob_window_start(now: DateTime<Utc>, active_insulin_hours: f64) -> DateTime<Utc> {
    let millis = (active_insulin_hours * MILLIS_PER_HOUR).round() as i64;
    now - Duration::milliseconds(millis)
}

/// Remaining active units of a single entry at `now`
///
/// Returns 0 for basal entries, entries outside the active window, and
/// entries timestamped in the future.
pub fn entry_contribution(entry: &InsulinEntry, now: DateTime<Utc>, active_insulin_hours: f64) -> f64 {
    if !entry.is_rapid() || active_insulin_hours <= 0.0 {
        return 0.0;
    }

    let elapsed_ms = (now - entry.timestamp).num_milliseconds();
    if elapsed_ms < 0 {
        return 0.0;
    }

    let elapsed_hours = elapsed_ms as f64 / MILLIS_PER_HOUR;
    entry.units * (1.0 - elapsed_hours / active_insulin_hours).max(0.0)
}

/// Compute insulin on board at `now`, rounded to the nearest 0.1 unit
pub fn compute_iob(now: DateTime<Utc>, entries: &[InsulinEntry], active_insulin_hours: f64) -> f64 {
    let window_start = iob_window_start(now, active_insulin_hours);

    let (count, total) = entries
        .iter()
        .filter(|e| e.is_rapid() && e.timestamp >= window_start)
        .map(|e| entry_contribution(e, now, active_insulin_hours))
        .fold((0usize, 0.0), |(n, sum), c| (n + 1, sum + c));

    let iob = round_to_tenth(total);
    tracing::debug!(
        "IOB {:.1} from {} rapid entries within {}h",
        iob,
        count,
        active_insulin_hours
    );
    iob
}
