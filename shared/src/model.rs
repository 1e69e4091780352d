use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// --- Typed IDs ---

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(
    /// Principal text of the identity that owns a record.
    OwnerId
);
typed_id!(RecordId);
typed_id!(CaseId);

impl OwnerId {
    /// Short, stable tag for log fields. Principals are never logged raw.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        hash.to_hex()[..12].to_string()
    }
}

impl CaseId {
    /// Leading segment of the id, shown in the tracking header.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

// --- Time ---

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        )
    }
}

// --- Coordinate: validated, NaN-safe ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    lat: f64,
    lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lon) {
            return Err(CoordinateError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lon(self) -> f64 {
        self.lon
    }
}

impl TryFrom<(f64, f64)> for Coordinate {
    type Error = CoordinateError;

    fn try_from((lat, lon): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lon)
    }
}

// --- Records ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Prescription {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub raw_text: String,
    pub analysis_result: String,
    pub created_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MedicationReminder {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub medicine_name: String,
    pub dosage: String,
    pub scheduled_at: UnixTimeMs,
    pub active: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DrugInteractionRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub medications: Vec<String>,
    pub summary: String,
    pub created_at: UnixTimeMs,
}

impl DrugInteractionRecord {
    pub const MIN_MEDICATIONS: usize = 2;

    #[must_use]
    pub fn has_valid_medication_count(&self) -> bool {
        self.medications.len() >= Self::MIN_MEDICATIONS
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DietRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub plan: String,
    pub created_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HospitalRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub location: String,
    pub results: String,
    pub created_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PriceRecord {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub medicine_name: String,
    /// JSON object of pharmacy name to search url.
    pub links: String,
    pub created_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HospitalSearchLog {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub query: String,
    pub latitude: f64,
    pub longitude: f64,
    pub emergency: bool,
    pub created_at: UnixTimeMs,
}

// --- Emergency ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EmergencyStatus {
    Requested,
    Dispatched,
    Arriving,
    Arrived,
    Completed,
}

impl EmergencyStatus {
    /// Fixed lifecycle order; the remote side only ever moves a case forward along it.
    pub const ALL: [Self; 5] = [
        Self::Requested,
        Self::Dispatched,
        Self::Arriving,
        Self::Arrived,
        Self::Completed,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Requested => 0,
            Self::Dispatched => 1,
            Self::Arriving => 2,
            Self::Arrived => 3,
            Self::Completed => 4,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "Requested",
            Self::Dispatched => "Dispatched",
            Self::Arriving => "Arriving",
            Self::Arrived => "Arrived",
            Self::Completed => "Completed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for EmergencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown emergency status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for EmergencyStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EmergencyCase {
    pub id: CaseId,
    pub owner_id: OwnerId,
    pub latitude: f64,
    pub longitude: f64,
    pub status: EmergencyStatus,
    pub hospital_id: Option<String>,
    pub created_at: UnixTimeMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_coordinates() {
        assert!(Coordinate::new(0.0, 0.0).is_ok());
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert!(Coordinate::new(-90.0, -180.0).is_ok());
        assert!(Coordinate::new(12.97, 77.59).is_ok());
    }

    #[test]
    fn test_invalid_coordinates() {
        assert!(matches!(
            Coordinate::new(91.0, 0.0),
            Err(CoordinateError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            Coordinate::new(0.0, -181.0),
            Err(CoordinateError::LongitudeOutOfRange(_))
        ));
        assert!(matches!(
            Coordinate::new(f64::NAN, 0.0),
            Err(CoordinateError::NonFinite)
        ));
        assert!(matches!(
            Coordinate::try_from((0.0, f64::INFINITY)),
            Err(CoordinateError::NonFinite)
        ));
    }

    #[test]
    fn test_status_order_matches_index() {
        for (i, status) in EmergencyStatus::ALL.iter().enumerate() {
            assert_eq!(status.index(), i);
        }
        assert!(EmergencyStatus::Requested < EmergencyStatus::Completed);
        assert!(EmergencyStatus::Completed.is_terminal());
        assert!(!EmergencyStatus::Arrived.is_terminal());
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("requested".parse(), Ok(EmergencyStatus::Requested));
        assert_eq!("ARRIVING".parse(), Ok(EmergencyStatus::Arriving));
        assert_eq!(" Completed ".parse(), Ok(EmergencyStatus::Completed));
        assert!("en_route".parse::<EmergencyStatus>().is_err());
    }

    #[test]
    fn test_case_id_short() {
        assert_eq!(CaseId::new("4f2a-77-b").short(), "4f2a");
        assert_eq!(CaseId::new("plain").short(), "plain");
    }

    #[test]
    fn test_owner_fingerprint_is_stable_and_opaque() {
        let owner = OwnerId::new("aaaaa-bbbbb-ccccc");
        assert_eq!(owner.fingerprint(), owner.fingerprint());
        assert_eq!(owner.fingerprint().len(), 12);
        assert_ne!(owner.fingerprint(), OwnerId::new("other").fingerprint());
    }

    #[test]
    fn test_interaction_record_medication_count() {
        let mut record = DrugInteractionRecord {
            id: RecordId::new("r1"),
            owner_id: OwnerId::new("u1"),
            medications: vec!["Aspirin".into()],
            summary: String::new(),
            created_at: UnixTimeMs(0),
        };
        assert!(!record.has_valid_medication_count());
        record.medications.push("Warfarin".into());
        assert!(record.has_valid_medication_count());
    }
}
