//! Per-blood-type stock derived from the donor collection.

use serde::Serialize;
use shared::domain::{BloodType, Donor, InventoryItem, StockStatus};

/// Stock below this is critical.
pub const CRITICAL_BELOW: u32 = 1;
/// Stock above this is excess.
pub const EXCESS_ABOVE: u32 = 5;

pub fn classify(units: u32) -> StockStatus {
    if units < CRITICAL_BELOW {
        StockStatus::Critical
    } else if units > EXCESS_ABOVE {
        StockStatus::Excess
    } else {
        StockStatus::Stable
    }
}

/// One item per blood type in [`BloodType::ALL`] order, zero counts included.
/// Units are available donors of that type.
pub fn aggregate(donors: &[Donor]) -> [InventoryItem; 8] {
    BloodType::ALL.map(|blood_type| {
        let units = donors
            .iter()
            .filter(|donor| donor.is_available && donor.blood_type == blood_type)
            .count();
        let units = u32::try_from(units).unwrap_or(u32::MAX);
        InventoryItem {
            blood_type,
            units,
            status: classify(units),
        }
    })
}

/// Non-zero stock counts, in display order.
pub fn available_counts(items: &[InventoryItem]) -> Vec<(BloodType, u32)> {
    items
        .iter()
        .filter(|item| item.units > 0)
        .map(|item| (item.blood_type, item.units))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total_donors: usize,
    /// Blood types whose stock is [`StockStatus::Critical`].
    pub critical_alerts: usize,
    pub available_units: usize,
}

impl DashboardStats {
    pub fn from_donors(donors: &[Donor]) -> Self {
        let inventory = aggregate(donors);
        Self {
            total_donors: donors.len(),
            critical_alerts: inventory
                .iter()
                .filter(|item| item.status == StockStatus::Critical)
                .count(),
            available_units: donors.iter().filter(|donor| donor.is_available).count(),
        }
    }
}
