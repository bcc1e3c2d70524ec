use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TrackingError,
    handle::WatchHandle,
    location::{Coordinate, EntityKey, LocationRecord},
    prelude::*,
    sensor::{LocationSample, LocationSensor, SensorEvent, SensorWatchId, WatchOptions},
    settings::TrackingSettings,
    store::LocationStore,
};

struct ActiveWatch {
    sensor_watch: SensorWatchId,
    cancel: CancellationToken,
}

/// Driver side of tracking. Watches the device location via [LocationSensor] and overwrites the
/// entity's record in the [LocationStore] on every sample that moved far enough.
///
/// Writes are at-most-once, a failed write is logged and dropped, the next sample gets a fresh
/// attempt.
pub struct LocationPublisher<S: LocationSensor, D: LocationStore> {
    sensor: Arc<S>,
    store: Arc<D>,
    settings: TrackingSettings,
    watches: Mutex<HashMap<WatchHandle, ActiveWatch>>,
}

impl<S: LocationSensor, D: LocationStore> LocationPublisher<S, D> {
    pub fn new(sensor: Arc<S>, store: Arc<D>, settings: TrackingSettings) -> Self {
        Self {
            sensor,
            store,
            settings,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start publishing the device location to `key`
    pub async fn start(&self, key: EntityKey) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();

        let sensor_watch = self
            .sensor
            .watch_position(WatchOptions::from(&self.settings), tx)
            .context("Failed to start location watch")?;

        let handle = WatchHandle::new();
        let cancel = CancellationToken::new();

        info!("Publishing location to {key} ({handle})");

        tokio::spawn(Self::publish_loop(
            self.store.clone(),
            key,
            rx,
            cancel.clone(),
            self.settings.min_distance_meters,
            self.settings.write_timeout(),
        ));

        self.watches.lock().await.insert(
            handle,
            ActiveWatch {
                sensor_watch,
                cancel,
            },
        );

        Ok(handle)
    }

    /// Stop a watch, does nothing if `handle` was already stopped or never existed
    pub async fn stop(&self, handle: WatchHandle) {
        let Some(watch) = self.watches.lock().await.remove(&handle) else {
            debug!("Ignoring stop for inactive {handle}");
            return;
        };

        watch.cancel.cancel();

        if let Err(why) = self.sensor.clear_watch(watch.sensor_watch) {
            let err = TrackingError::Teardown(format!("sensor watch for {handle}: {why:#}"));
            warn!("{err}");
        }

        info!("Stopped publishing ({handle})");
    }

    /// Number of watches that haven't been stopped
    pub async fn active_watches(&self) -> usize {
        self.watches.lock().await.len()
    }

    async fn publish_loop(
        store: Arc<D>,
        key: EntityKey,
        mut samples: mpsc::UnboundedReceiver<SensorEvent>,
        cancel: CancellationToken,
        min_distance: f64,
        write_timeout: Duration,
    ) {
        let mut last_written: Option<Coordinate> = None;

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = samples.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Stop may have landed while this event was queued
            if cancel.is_cancelled() {
                break;
            }

            match event {
                SensorEvent::Sample(sample) => {
                    let Some(record) = Self::qualify(&key, sample, last_written, min_distance)
                    else {
                        continue;
                    };

                    if Self::write(store.as_ref(), &key, record, write_timeout).await {
                        last_written = Some(record.coordinate);
                    }
                }
                SensorEvent::Error(why) => {
                    warn!("{}", TrackingError::Sensor(why));
                }
            }
        }
    }

    /// Turn a sample into a record, if it's valid and far enough from the last written location
    fn qualify(
        key: &EntityKey,
        sample: LocationSample,
        last_written: Option<Coordinate>,
        min_distance: f64,
    ) -> Option<LocationRecord> {
        let coordinate = match sample.coordinate.validate() {
            Ok(coordinate) => coordinate,
            Err(why) => {
                warn!("Rejected sample for {key}: {why}");
                return None;
            }
        };

        if let Some(last) = last_written {
            let moved = last.distance_meters(&coordinate);
            if moved < min_distance {
                debug!("Skipping sample for {key}, only moved {moved:.1}m");
                return None;
            }
        }

        Some(LocationRecord::new(coordinate, Utc::now()))
    }

    async fn write(store: &D, key: &EntityKey, record: LocationRecord, limit: Duration) -> bool {
        let err = match tokio::time::timeout(limit, store.set(key, record)).await {
            Ok(Ok(())) => {
                debug!("Location updated at {key}: {}", record.coordinate);
                return true;
            }
            Ok(Err(why)) => TrackingError::StoreWrite(format!("{why:#}")),
            Err(_) => TrackingError::StoreWrite(format!("timed out after {limit:?}")),
        };
        warn!("{err}");
        false
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;
    use crate::{
        store::MemoryStore,
        tests::{FailingStore, MockSensor, settle},
    };

    type TestPublisher = LocationPublisher<MockSensor, MemoryStore>;

    fn mk_publisher() -> (TestPublisher, Arc<MockSensor>, Arc<MemoryStore>) {
        let sensor = Arc::new(MockSensor::default());
        let store = Arc::new(MemoryStore::new());
        let publisher =
            LocationPublisher::new(sensor.clone(), store.clone(), TrackingSettings::default());
        (publisher, sensor, store)
    }

    fn bus1() -> EntityKey {
        EntityKey::new("bus1").unwrap()
    }

    #[test]
    async fn test_sample_written() {
        let (publisher, sensor, store) = mk_publisher();

        publisher.start(bus1()).await.unwrap();
        sensor.emit(20.96, 77.75);
        settle().await;

        let record = store.get(&bus1()).await.expect("Nothing written");
        assert_eq!(record.coordinate, Coordinate::new(20.96, 77.75));
        assert!(record.written_at.is_some());
    }

    #[test]
    async fn test_watch_options_forwarded() {
        let (publisher, sensor, _store) = mk_publisher();

        publisher.start(bus1()).await.unwrap();

        assert_eq!(
            sensor.last_options(),
            Some(WatchOptions {
                min_distance_meters: 10.0,
                high_accuracy: true,
            })
        );
    }

    #[test]
    async fn test_invalid_coordinate_rejected() {
        let (publisher, sensor, store) = mk_publisher();

        publisher.start(bus1()).await.unwrap();
        sensor.emit(200.0, 77.75);
        settle().await;

        assert_eq!(store.write_count().await, 0);
        assert!(store.get(&bus1()).await.is_none());
    }

    #[test]
    async fn test_distance_filter() {
        let (publisher, sensor, store) = mk_publisher();

        publisher.start(bus1()).await.unwrap();
        sensor.emit(20.96, 77.75);
        // ~5m north, filtered
        sensor.emit(20.96005, 77.75);
        // ~110m north
        sensor.emit(20.961, 77.75);
        settle().await;

        assert_eq!(store.write_count().await, 2);
        assert_eq!(
            store.get(&bus1()).await.map(|r| r.coordinate),
            Some(Coordinate::new(20.961, 77.75))
        );
    }

    #[test]
    async fn test_sensor_error_keeps_watch() {
        let (publisher, sensor, store) = mk_publisher();

        publisher.start(bus1()).await.unwrap();
        sensor.emit_error("GPS signal lost");
        sensor.emit(20.96, 77.75);
        settle().await;

        assert_eq!(store.write_count().await, 1);
        assert_eq!(sensor.live_watches(), 1);
    }

    #[test]
    async fn test_write_failure_keeps_sampling() {
        let sensor = Arc::new(MockSensor::default());
        let store = Arc::new(FailingStore::default());
        store.fail_next(1);
        let publisher =
            LocationPublisher::new(sensor.clone(), store.clone(), TrackingSettings::default());

        publisher.start(bus1()).await.unwrap();
        sensor.emit(20.96, 77.75);
        // Within 10m of the failed write, still goes out since nothing was written
        sensor.emit(20.96001, 77.75);
        settle().await;

        assert_eq!(store.attempts(), 2);
        assert_eq!(
            store.inner().get(&bus1()).await.map(|r| r.coordinate),
            Some(Coordinate::new(20.96001, 77.75))
        );
    }

    #[test]
    async fn test_stop_idempotent() {
        let (publisher, sensor, store) = mk_publisher();

        let handle = publisher.start(bus1()).await.unwrap();
        assert_eq!(publisher.active_watches().await, 1);

        publisher.stop(handle).await;
        publisher.stop(handle).await;
        publisher.stop(WatchHandle::new()).await;

        assert_eq!(publisher.active_watches().await, 0);
        assert_eq!(sensor.live_watches(), 0);
        assert_eq!(sensor.cleared(), 1);

        sensor.emit(20.96, 77.75);
        settle().await;
        assert_eq!(store.write_count().await, 0, "Stopped watch still wrote");
    }

    #[test]
    async fn test_late_sample_after_stop_dropped() {
        let (publisher, sensor, store) = mk_publisher();

        let handle = publisher.start(bus1()).await.unwrap();
        // Queued but not yet processed when stop lands
        sensor.emit(20.96, 77.75);
        publisher.stop(handle).await;
        settle().await;

        assert_eq!(store.write_count().await, 0);
    }
}
