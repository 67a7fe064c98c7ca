//! View state behind the dashboard: donors, activity feed and the active
//! emergency alert.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use shared::domain::{ActivityEvent, BloodType, Donor, Emergency, EmergencyId, InventoryItem};

use crate::{feed, inventory, normalize::DonorChange, reconcile::reconcile};

/// How long an emergency broadcast stays on screen.
pub const EMERGENCY_ALERT_TTL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEmergency {
    pub emergency: Emergency,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct DonorBoard {
    donors: Vec<Donor>,
    feed: Vec<ActivityEvent>,
    emergency: Option<ActiveEmergency>,
}

impl DonorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn donors(&self) -> &[Donor] {
        &self.donors
    }

    pub fn feed(&self) -> &[ActivityEvent] {
        &self.feed
    }

    pub fn inventory(&self) -> [InventoryItem; 8] {
        inventory::aggregate(&self.donors)
    }

    pub fn stats(&self) -> inventory::DashboardStats {
        inventory::DashboardStats::from_donors(&self.donors)
    }

    /// Replaces the collection with a fresh snapshot, newest first.
    pub fn load(&mut self, donors: Vec<Donor>) {
        self.donors = donors;
    }

    pub fn apply(&mut self, change: &DonorChange, captured_at: DateTime<Utc>) {
        self.donors = reconcile(&self.donors, change);
        self.feed = feed::reduce(&self.feed, change, captured_at);
    }

    pub fn raise_emergency(&mut self, emergency: Emergency, now: Instant) {
        self.emergency = Some(ActiveEmergency {
            emergency,
            expires_at: now + EMERGENCY_ALERT_TTL,
        });
    }

    /// Returns the alert still showing at `now`, dropping it once expired.
    pub fn active_emergency(&mut self, now: Instant) -> Option<&Emergency> {
        if self
            .emergency
            .as_ref()
            .is_some_and(|active| active.expires_at <= now)
        {
            self.emergency = None;
        }
        self.emergency.as_ref().map(|active| &active.emergency)
    }

    pub fn dismiss_emergency(&mut self) -> bool {
        self.emergency.take().is_some()
    }

    /// Clears the alert only if `id` is still the one showing.
    pub fn expire_emergency(&mut self, id: EmergencyId) -> bool {
        if self
            .emergency
            .as_ref()
            .is_some_and(|active| active.emergency.id == id)
        {
            self.emergency = None;
            return true;
        }
        false
    }
}

/// Donor list filter: free-text on name or location plus an optional type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DonorFilter {
    pub search: String,
    pub blood_type: Option<BloodType>,
}

impl DonorFilter {
    pub fn matches(&self, donor: &Donor) -> bool {
        let needle = self.search.trim().to_lowercase();
        let matches_search = needle.is_empty()
            || donor.name.to_lowercase().contains(&needle)
            || donor.location.to_lowercase().contains(&needle);
        let matches_type = self
            .blood_type
            .map_or(true, |blood_type| donor.blood_type == blood_type);
        matches_search && matches_type
    }

    pub fn apply<'a>(&self, donors: &'a [Donor]) -> Vec<&'a Donor> {
        donors.iter().filter(|donor| self.matches(donor)).collect()
    }
}
