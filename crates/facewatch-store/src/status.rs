//! Presence summary: who has been identified within the cooldown window.

use crate::StoredEvent;
use chrono::{DateTime, TimeDelta, Utc};
use facewatch_core::Identity;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct IdentityStatus {
    pub id: i64,
    pub display_name: String,
    pub external_code: String,
    pub present: bool,
    /// Events within the window.
    pub detections: usize,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceSummary {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    /// Present share of all identities, as a whole percentage.
    pub attendance_rate: u32,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub window_secs: u64,
    pub identities: Vec<IdentityStatus>,
    pub summary: PresenceSummary,
}

/// Start of the window reaching `secs` back from `now`, clamped to the Unix
/// epoch for windows longer than the representable range.
pub fn window_start(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |start| start.max(DateTime::<Utc>::UNIX_EPOCH))
}

/// Build the status view from the identity list and the events inside the
/// window (as returned by `query_recent`). Events are matched to identities
/// by display name.
pub fn summarize(identities: &[Identity], recent: &[StoredEvent], window_secs: u64, now: DateTime<Utc>) -> StatusReport {
    let mut by_name: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::new();
    for stored in recent {
        let entry = by_name
            .entry(stored.event.identity_name.as_str())
            .or_insert((0, stored.event.timestamp));
        entry.0 += 1;
        entry.1 = entry.1.max(stored.event.timestamp);
    }

    let statuses: Vec<IdentityStatus> = identities
        .iter()
        .map(|identity| {
            let seen = by_name.get(identity.display_name.as_str());
            IdentityStatus {
                id: identity.id,
                display_name: identity.display_name.clone(),
                external_code: identity.external_code.clone(),
                present: seen.is_some(),
                detections: seen.map_or(0, |(count, _)| *count),
                last_seen: seen.map(|(_, ts)| *ts),
            }
        })
        .collect();

    let total = statuses.len();
    let present = statuses.iter().filter(|s| s.present).count();
    let attendance_rate = if total == 0 {
        0
    } else {
        ((present as f64 / total as f64) * 100.0).round() as u32
    };

    StatusReport {
        window_secs,
        identities: statuses,
        summary: PresenceSummary {
            total,
            present,
            absent: total - present,
            attendance_rate,
            generated_at: now,
        },
    }
}
