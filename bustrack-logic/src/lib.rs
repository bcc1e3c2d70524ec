mod credentials;
mod error;
mod handle;
mod location;
mod permission;
mod publisher;
mod sensor;
mod session;
mod settings;
mod store;
mod subscriber;

pub use credentials::{CredentialStore, MemoryCredentials};
pub use error::TrackingError;
pub use handle::WatchHandle;
pub use location::{Coordinate, EntityKey, LocationRecord, UtcDT};
pub use permission::{
    PermissionGate, PermissionLevel, PermissionPrompt, PermissionState, Refresh,
};
pub use publisher::LocationPublisher;
pub use sensor::{
    LocationSample, LocationSensor, SensorEvent, SensorEventTx, SensorWatchId, WatchOptions,
};
pub use session::{
    LifecycleState, Role, SessionController, SessionHandle, SessionUpdate, SessionUpdateSender,
};
pub use settings::TrackingSettings;
pub use store::{LocationStore, MemoryStore, StoreEvent, StoreEventTx, SubscriptionId};
pub use subscriber::{LocationSink, LocationSubscriber};

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
