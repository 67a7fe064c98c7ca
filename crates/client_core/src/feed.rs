//! Bounded, newest-first activity log of donor changes.

use chrono::{DateTime, Utc};
use shared::domain::ActivityEvent;

use crate::normalize::DonorChange;

pub const FEED_CAPACITY: usize = 5;

pub fn describe(change: &DonorChange) -> String {
    match (change, change.name()) {
        (DonorChange::Inserted(_), Some(name)) => format!("New donor {name} registered."),
        (DonorChange::Inserted(_), None) => "New donor registered.".to_string(),
        (DonorChange::Updated { .. }, Some(name)) => format!("Updated status for {name}."),
        (DonorChange::Updated { .. }, None) => "Donor status updated.".to_string(),
        (DonorChange::Deleted(_), _) => "Donor removed from system.".to_string(),
    }
}

/// Prepends an entry for `change` and drops the oldest beyond
/// [`FEED_CAPACITY`].
pub fn reduce(
    log: &[ActivityEvent],
    change: &DonorChange,
    captured_at: DateTime<Utc>,
) -> Vec<ActivityEvent> {
    let entry = ActivityEvent {
        kind: change.kind(),
        message: describe(change),
        captured_at,
    };
    std::iter::once(entry)
        .chain(log.iter().cloned())
        .take(FEED_CAPACITY)
        .collect()
}
