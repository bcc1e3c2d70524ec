use thiserror::Error;

use crate::permission::PermissionLevel;

/// Failures the tracking loop can run into.
///
/// Only [TrackingError::PermissionDenied] and [TrackingError::NotAuthenticated] are meant for the
/// user, everything else is logged and the loop carries on. A key with nothing written to it is
/// not an error, see [crate::StoreEvent::NoData].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackingError {
    /// The user refused location access at the given level
    #[error("Location permission denied ({0:?})")]
    PermissionDenied(PermissionLevel),
    /// The location sensor reported a problem, the watch keeps running
    #[error("Location sensor error: {0}")]
    Sensor(String),
    /// A location write failed and was dropped
    #[error("Failed to write location: {0}")]
    StoreWrite(String),
    /// Releasing a watch or subscription failed
    #[error("Failed to release {0}")]
    Teardown(String),
    #[error("Coordinate ({latitude}, {longitude}) is out of range")]
    InvalidCoordinate { latitude: f64, longitude: f64 },
    #[error("Invalid entity key {0:?}")]
    InvalidKey(String),
    /// Publishing requires a signed in driver
    #[error("Sign in required to share location")]
    NotAuthenticated,
}
