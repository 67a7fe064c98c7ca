use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_newtype!(DonorId);
id_newtype!(EmergencyId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BloodType {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

impl BloodType {
    /// Declared display order. Inventory output follows it.
    pub const ALL: [BloodType; 8] = [
        BloodType::APositive,
        BloodType::ANegative,
        BloodType::BPositive,
        BloodType::BNegative,
        BloodType::AbPositive,
        BloodType::AbNegative,
        BloodType::OPositive,
        BloodType::ONegative,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BloodType::APositive => "A+",
            BloodType::ANegative => "A-",
            BloodType::BPositive => "B+",
            BloodType::BNegative => "B-",
            BloodType::AbPositive => "AB+",
            BloodType::AbNegative => "AB-",
            BloodType::OPositive => "O+",
            BloodType::ONegative => "O-",
        }
    }
}

impl fmt::Display for BloodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown blood type: {0:?}")]
pub struct UnknownBloodType(pub String);

impl FromStr for BloodType {
    type Err = UnknownBloodType;

    /// Accepts the canonical labels ("AB-") case-insensitively, plus spoken
    /// forms such as "O positive" or "a_negative".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_ascii_uppercase()
            .replace(['_', ' '], "")
            .replace("POSITIVE", "+")
            .replace("POS", "+")
            .replace("NEGATIVE", "-")
            .replace("NEG", "-");
        BloodType::ALL
            .into_iter()
            .find(|blood_type| blood_type.as_str() == normalized)
            .ok_or_else(|| UnknownBloodType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    pub id: DonorId,
    pub name: String,
    pub blood_type: BloodType,
    pub last_donation_date: Option<NaiveDate>,
    pub contact: String,
    pub location: String,
    pub is_available: bool,
    pub last_notified: Option<DateTime<Utc>>,
}

impl Donor {
    /// Shallow merge: every field present in `patch` replaces the current one.
    pub fn merged(&self, patch: &DonorPatch) -> Donor {
        Donor {
            id: self.id,
            name: patch.name.clone().unwrap_or_else(|| self.name.clone()),
            blood_type: patch.blood_type.unwrap_or(self.blood_type),
            last_donation_date: patch
                .last_donation_date
                .unwrap_or(self.last_donation_date),
            contact: patch.contact.clone().unwrap_or_else(|| self.contact.clone()),
            location: patch
                .location
                .clone()
                .unwrap_or_else(|| self.location.clone()),
            is_available: patch.is_available.unwrap_or(self.is_available),
            last_notified: patch.last_notified.unwrap_or(self.last_notified),
        }
    }
}

/// Registration payload; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDonor {
    pub name: String,
    pub blood_type: BloodType,
    pub last_donation_date: Option<NaiveDate>,
    pub contact: String,
    pub location: String,
    pub is_available: bool,
}

/// Partial donor fields. `None` means "not present"; for the nullable
/// columns `Some(None)` means "explicitly cleared".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorPatch {
    pub name: Option<String>,
    pub blood_type: Option<BloodType>,
    pub last_donation_date: Option<Option<NaiveDate>>,
    pub contact: Option<String>,
    pub location: Option<String>,
    pub is_available: Option<bool>,
    pub last_notified: Option<Option<DateTime<Utc>>>,
}

impl DonorPatch {
    pub fn is_empty(&self) -> bool {
        self == &DonorPatch::default()
    }

    pub fn availability(is_available: bool) -> Self {
        Self {
            is_available: Some(is_available),
            ..Self::default()
        }
    }

    pub fn notified_at(at: DateTime<Utc>) -> Self {
        Self {
            last_notified: Some(Some(at)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            other => Err(format!("unknown urgency: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Emergency {
    pub id: EmergencyId,
    pub blood_type: BloodType,
    pub hospital: String,
    pub units_needed: u32,
    pub urgency: Urgency,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEmergency {
    pub blood_type: BloodType,
    pub hospital: String,
    pub units_needed: u32,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    Critical,
    Stable,
    Excess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub blood_type: BloodType,
    pub units: u32,
    pub status: StockStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ChangeKind,
    pub message: String,
    pub captured_at: DateTime<Utc>,
}
