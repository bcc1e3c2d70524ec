use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    location::{Coordinate, UtcDT},
    prelude::*,
    settings::TrackingSettings,
};

/// Options passed to the platform when starting a watch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchOptions {
    /// Movement needed before the platform reports a new sample
    pub min_distance_meters: f64,
    pub high_accuracy: bool,
}

impl From<&TrackingSettings> for WatchOptions {
    fn from(settings: &TrackingSettings) -> Self {
        Self {
            min_distance_meters: settings.min_distance_meters,
            high_accuracy: settings.high_accuracy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub coordinate: Coordinate,
    pub timestamp: UtcDT,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Sample(LocationSample),
    /// Transient sensor failure, the watch stays alive
    Error(String),
}

pub type SensorEventTx = mpsc::UnboundedSender<SensorEvent>;

/// Platform identifier of a running watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorWatchId(pub u64);

/// Device location source
pub trait LocationSensor: Send + Sync + 'static {
    /// Start continuous sampling, events are pushed to `events` until the watch is cleared.
    /// Sends to a closed channel should be ignored.
    fn watch_position(&self, options: WatchOptions, events: SensorEventTx)
    -> Result<SensorWatchId>;
    /// Stop a watch started with [LocationSensor::watch_position]
    fn clear_watch(&self, id: SensorWatchId) -> Result;
}
