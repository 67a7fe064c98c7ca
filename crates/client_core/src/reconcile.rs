//! Applies one donor change event to a donor collection.

use shared::domain::Donor;

use crate::normalize::DonorChange;

/// Returns the collection after `change`. Newest donors come first; the
/// input slice is never touched.
///
/// Inserting an id that is already present, and updating or deleting one
/// that is absent, leave the collection as it was.
pub fn reconcile(donors: &[Donor], change: &DonorChange) -> Vec<Donor> {
    match change {
        DonorChange::Inserted(donor) => {
            if donors.iter().any(|existing| existing.id == donor.id) {
                return donors.to_vec();
            }
            let mut next = Vec::with_capacity(donors.len() + 1);
            next.push(donor.clone());
            next.extend_from_slice(donors);
            next
        }
        DonorChange::Updated { id, patch } => donors
            .iter()
            .map(|existing| {
                if existing.id == *id {
                    existing.merged(patch)
                } else {
                    existing.clone()
                }
            })
            .collect(),
        DonorChange::Deleted(id) => donors
            .iter()
            .filter(|existing| existing.id != *id)
            .cloned()
            .collect(),
    }
}
