use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::location::EntityKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
/// Settings for location tracking, shared by drivers and riders
pub struct TrackingSettings {
    /// Store key the vehicle's location is published under
    pub entity_key: EntityKey,
    /// Minimum movement in meters between two published locations, keeps write volume down
    pub min_distance_meters: f64,
    /// Ask the platform for its most accurate location source
    pub high_accuracy: bool,
    /// How long a single location write may take before it's dropped
    pub write_timeout_seconds: u32,
}

impl TrackingSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds as u64)
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            entity_key: EntityKey::default(),
            min_distance_meters: 10.0,
            high_accuracy: true,
            write_timeout_seconds: 10,
        }
    }
}
