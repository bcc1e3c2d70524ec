use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TrackingError;

/// Convenience alias for UTC DT
pub type UtcDT = DateTime<Utc>;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Returns self if the coordinate is within range, used to reject bad sensor output before it
    /// gets anywhere near the store.
    pub fn validate(self) -> Result<Self, TrackingError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(TrackingError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    /// Great-circle distance to `other` in meters (haversine)
    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let sin_dlat = (delta_lat / 2.0).sin();
        let sin_dlon = (delta_lon / 2.0).sin();
        let a = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_METERS * c
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// The value stored under an [EntityKey], always replaced as a whole.
///
/// Stored flat (`{"latitude", "longitude", "writtenAt"}`) so records from older clients that
/// only wrote the coordinate still decode, those come back with `written_at` unset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    #[serde(flatten)]
    pub coordinate: Coordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<UtcDT>,
}

impl LocationRecord {
    pub fn new(coordinate: Coordinate, written_at: UtcDT) -> Self {
        Self {
            coordinate,
            written_at: Some(written_at),
        }
    }
}

const DEFAULT_ENTITY_KEY: &str = "busLocation";
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']'];

/// Path of a tracked entity in the location store, e.g. `busLocation` or `routes/3/bus`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(raw: &str) -> Result<Self, TrackingError> {
        let trimmed = raw.trim_matches('/');

        let valid = !trimmed.is_empty()
            && trimmed.split('/').all(|segment| !segment.is_empty())
            && !trimmed
                .chars()
                .any(|c| c.is_control() || FORBIDDEN_KEY_CHARS.contains(&c));

        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(TrackingError::InvalidKey(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityKey {
    fn default() -> Self {
        Self(DEFAULT_ENTITY_KEY.to_string())
    }
}

impl TryFrom<String> for EntityKey {
    type Error = TrackingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<EntityKey> for String {
    fn from(value: EntityKey) -> Self {
        value.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
