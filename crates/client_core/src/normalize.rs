//! Raw store rows to domain entities and back.

use chrono::{DateTime, NaiveDate, Utc};
use realtime_store::{ChangeEvent, Record, Table};
use serde_json::Value;
use shared::domain::{
    BloodType, ChangeKind, Donor, DonorId, DonorPatch, Emergency, EmergencyId, NewDonor,
    NewEmergency, UnknownBloodType, Urgency,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("missing column {0}")]
    MissingColumn(&'static str),
    #[error("invalid value for column {column}: {reason}")]
    InvalidColumn { column: &'static str, reason: String },
    #[error(transparent)]
    BloodType(#[from] UnknownBloodType),
    #[error("change event for table {0} is not a donor change")]
    WrongTable(Table),
    #[error("change event carries no row id")]
    MissingRowId,
}

/// A donor change event in domain terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DonorChange {
    Inserted(Donor),
    Updated { id: DonorId, patch: DonorPatch },
    Deleted(DonorId),
}

impl DonorChange {
    pub fn from_event(event: &ChangeEvent) -> Result<Self, NormalizeError> {
        if event.table != Table::Donors {
            return Err(NormalizeError::WrongTable(event.table));
        }
        match event.kind {
            ChangeKind::Insert => donor_from_record(&event.new).map(DonorChange::Inserted),
            ChangeKind::Update => {
                let id = event.row_id().ok_or(NormalizeError::MissingRowId)?;
                Ok(DonorChange::Updated {
                    id: parse_id(id)?,
                    patch: patch_from_record(&event.new)?,
                })
            }
            ChangeKind::Delete => {
                let id = event.row_id().ok_or(NormalizeError::MissingRowId)?;
                Ok(DonorChange::Deleted(parse_id(id)?))
            }
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            DonorChange::Inserted(_) => ChangeKind::Insert,
            DonorChange::Updated { .. } => ChangeKind::Update,
            DonorChange::Deleted(_) => ChangeKind::Delete,
        }
    }

    pub fn donor_id(&self) -> DonorId {
        match self {
            DonorChange::Inserted(donor) => donor.id,
            DonorChange::Updated { id, .. } | DonorChange::Deleted(id) => *id,
        }
    }

    /// Donor name carried by the payload, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            DonorChange::Inserted(donor) => Some(donor.name.as_str()),
            DonorChange::Updated { patch, .. } => patch.name.as_deref(),
            DonorChange::Deleted(_) => None,
        }
    }
}

pub fn donor_from_record(record: &Record) -> Result<Donor, NormalizeError> {
    let id = parse_id(required_str(record, "id")?)?;
    Ok(Donor {
        id,
        name: required_str(record, "name")?.to_string(),
        blood_type: required_str(record, "blood_type")?.parse()?,
        last_donation_date: optional_date(record, "last_donation_date")?.flatten(),
        contact: optional_str(record, "contact")?
            .flatten()
            .unwrap_or_default(),
        location: optional_str(record, "location")?
            .flatten()
            .unwrap_or_default(),
        is_available: optional_bool(record, "is_available")?.unwrap_or(true),
        last_notified: optional_timestamp(record, "last_notified")?.flatten(),
    })
}

/// Only the columns present in `record` end up in the patch.
pub fn patch_from_record(record: &Record) -> Result<DonorPatch, NormalizeError> {
    let blood_type = match optional_str(record, "blood_type")?.flatten() {
        Some(label) => Some(label.parse::<BloodType>()?),
        None => None,
    };
    Ok(DonorPatch {
        name: optional_str(record, "name")?.flatten(),
        blood_type,
        last_donation_date: optional_date(record, "last_donation_date")?,
        contact: optional_str(record, "contact")?.flatten(),
        location: optional_str(record, "location")?.flatten(),
        is_available: optional_bool(record, "is_available")?,
        last_notified: optional_timestamp(record, "last_notified")?,
    })
}

pub fn new_donor_to_record(donor: &NewDonor) -> Record {
    let mut record = Record::new();
    record.insert("name".into(), Value::String(donor.name.clone()));
    record.insert(
        "blood_type".into(),
        Value::String(donor.blood_type.as_str().into()),
    );
    record.insert(
        "last_donation_date".into(),
        date_value(donor.last_donation_date),
    );
    record.insert("contact".into(), Value::String(donor.contact.clone()));
    record.insert("location".into(), Value::String(donor.location.clone()));
    record.insert("is_available".into(), Value::Bool(donor.is_available));
    record
}

pub fn patch_to_record(patch: &DonorPatch) -> Record {
    let mut record = Record::new();
    if let Some(name) = &patch.name {
        record.insert("name".into(), Value::String(name.clone()));
    }
    if let Some(blood_type) = patch.blood_type {
        record.insert(
            "blood_type".into(),
            Value::String(blood_type.as_str().into()),
        );
    }
    if let Some(date) = patch.last_donation_date {
        record.insert("last_donation_date".into(), date_value(date));
    }
    if let Some(contact) = &patch.contact {
        record.insert("contact".into(), Value::String(contact.clone()));
    }
    if let Some(location) = &patch.location {
        record.insert("location".into(), Value::String(location.clone()));
    }
    if let Some(is_available) = patch.is_available {
        record.insert("is_available".into(), Value::Bool(is_available));
    }
    if let Some(at) = patch.last_notified {
        record.insert(
            "last_notified".into(),
            at.map(|at| Value::String(at.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
    }
    record
}

pub fn emergency_from_record(record: &Record) -> Result<Emergency, NormalizeError> {
    let id = required_str(record, "id")?
        .parse::<EmergencyId>()
        .map_err(|err| invalid("id", err))?;
    let units_needed = record
        .get("units_needed")
        .ok_or(NormalizeError::MissingColumn("units_needed"))?;
    let units_needed = units_needed
        .as_u64()
        .or_else(|| units_needed.as_str().and_then(|raw| raw.trim().parse().ok()))
        .and_then(|units| u32::try_from(units).ok())
        .ok_or_else(|| invalid("units_needed", "expected a non-negative integer"))?;
    let created_at = optional_timestamp(record, "created_at")?
        .flatten()
        .unwrap_or_else(Utc::now);
    Ok(Emergency {
        id,
        blood_type: required_str(record, "blood_type")?.parse()?,
        hospital: required_str(record, "hospital")?.to_string(),
        units_needed,
        urgency: required_str(record, "urgency")?
            .parse::<Urgency>()
            .map_err(|reason| invalid("urgency", reason))?,
        created_at,
    })
}

pub fn new_emergency_to_record(emergency: &NewEmergency) -> Record {
    let mut record = Record::new();
    record.insert(
        "blood_type".into(),
        Value::String(emergency.blood_type.as_str().into()),
    );
    record.insert("hospital".into(), Value::String(emergency.hospital.clone()));
    record.insert(
        "units_needed".into(),
        Value::from(u64::from(emergency.units_needed)),
    );
    record.insert(
        "urgency".into(),
        Value::String(emergency.urgency.as_str().into()),
    );
    record
}

fn invalid(column: &'static str, reason: impl ToString) -> NormalizeError {
    NormalizeError::InvalidColumn {
        column,
        reason: reason.to_string(),
    }
}

fn parse_id(raw: &str) -> Result<DonorId, NormalizeError> {
    raw.parse().map_err(|err| invalid("id", err))
}

fn date_value(date: Option<NaiveDate>) -> Value {
    date.map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn required_str<'a>(record: &'a Record, column: &'static str) -> Result<&'a str, NormalizeError> {
    match record.get(column) {
        Some(Value::String(value)) => Ok(value.as_str()),
        Some(Value::Null) | None => Err(NormalizeError::MissingColumn(column)),
        Some(other) => Err(invalid(column, format!("expected text, got {other}"))),
    }
}

/// `None`: column absent. `Some(None)`: column present and null.
fn optional_str(
    record: &Record,
    column: &'static str,
) -> Result<Option<Option<String>>, NormalizeError> {
    match record.get(column) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(value)) => Ok(Some(Some(value.clone()))),
        Some(other) => Err(invalid(column, format!("expected text, got {other}"))),
    }
}

fn optional_bool(record: &Record, column: &'static str) -> Result<Option<bool>, NormalizeError> {
    match record.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(Value::Number(value)) if value.as_i64() == Some(0) => Ok(Some(false)),
        Some(Value::Number(value)) if value.as_i64() == Some(1) => Ok(Some(true)),
        Some(other) => Err(invalid(column, format!("expected boolean, got {other}"))),
    }
}

fn optional_date(
    record: &Record,
    column: &'static str,
) -> Result<Option<Option<NaiveDate>>, NormalizeError> {
    let Some(raw) = optional_str(record, column)? else {
        return Ok(None);
    };
    let Some(raw) = raw else {
        return Ok(Some(None));
    };
    if let Ok(date) = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        return Ok(Some(Some(date)));
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| Some(Some(at.date_naive())))
        .map_err(|err| invalid(column, err))
}

fn optional_timestamp(
    record: &Record,
    column: &'static str,
) -> Result<Option<Option<DateTime<Utc>>>, NormalizeError> {
    let Some(raw) = optional_str(record, column)? else {
        return Ok(None);
    };
    let Some(raw) = raw else {
        return Ok(Some(None));
    };
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|at| Some(Some(at.with_timezone(&Utc))))
        .map_err(|err| invalid(column, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    const ID: &str = "5b0b4a53-5d3c-4a59-9a9c-0a6f5f3b2c11";

    #[test]
    fn full_row_maps_every_column() {
        let donor = donor_from_record(&record(json!({
            "id": ID,
            "name": "Jane Doe",
            "blood_type": "AB-",
            "last_donation_date": "2024-03-01",
            "contact": "555-0100",
            "location": "Brooklyn",
            "is_available": false,
            "last_notified": "2024-05-01T10:00:00+00:00",
            "created_at": "2024-01-01T00:00:00Z",
        })))
        .expect("donor");
        assert_eq!(donor.id.to_string(), ID);
        assert_eq!(donor.blood_type, BloodType::AbNegative);
        assert_eq!(
            donor.last_donation_date,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert!(!donor.is_available);
        assert!(donor.last_notified.is_some());
    }

    #[test]
    fn unknown_blood_type_is_rejected() {
        let err = donor_from_record(&record(json!({
            "id": ID,
            "name": "Jane",
            "blood_type": "Z+",
        })))
        .expect_err("blood type");
        assert!(matches!(err, NormalizeError::BloodType(_)));
    }

    #[test]
    fn partial_row_only_sets_present_columns() {
        let patch = patch_from_record(&record(json!({
            "id": ID,
            "is_available": false,
            "last_notified": null,
        })))
        .expect("patch");
        assert_eq!(patch.is_available, Some(false));
        assert_eq!(patch.last_notified, Some(None));
        assert_eq!(patch.name, None);
        assert_eq!(patch.blood_type, None);
        assert_eq!(patch.last_donation_date, None);
    }

    #[test]
    fn patch_round_trips_through_columns() {
        let patch = DonorPatch {
            location: Some("Queens".into()),
            blood_type: Some(BloodType::ONegative),
            ..DonorPatch::default()
        };
        let columns = patch_to_record(&patch);
        assert_eq!(columns.len(), 2);
        assert_eq!(columns["blood_type"], json!("O-"));
        assert_eq!(patch_from_record(&columns).expect("patch"), patch);
    }

    #[test]
    fn delete_event_uses_old_row_id() {
        let event = ChangeEvent::deleted(Table::Donors, record(json!({ "id": ID })));
        let change = DonorChange::from_event(&event).expect("change");
        assert_eq!(change, DonorChange::Deleted(ID.parse().expect("id")));
    }

    #[test]
    fn emergency_events_are_not_donor_changes() {
        let event = ChangeEvent::inserted(Table::Emergencies, record(json!({ "id": ID })));
        assert_eq!(
            DonorChange::from_event(&event),
            Err(NormalizeError::WrongTable(Table::Emergencies))
        );
    }

    #[test]
    fn emergency_row_coerces_urgency_and_units() {
        let emergency = emergency_from_record(&record(json!({
            "id": ID,
            "blood_type": "O-",
            "hospital": "St. Mary",
            "units_needed": 4,
            "urgency": "CRITICAL",
            "created_at": "2024-06-01T12:00:00Z",
        })))
        .expect("emergency");
        assert_eq!(emergency.urgency, Urgency::Critical);
        assert_eq!(emergency.units_needed, 4);
        assert_eq!(emergency.blood_type, BloodType::ONegative);
    }
}
