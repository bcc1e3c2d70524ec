use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::TrackingError,
    handle::WatchHandle,
    location::{Coordinate, EntityKey},
    prelude::*,
    store::{LocationStore, StoreEvent, SubscriptionId},
};

/// Renders what a [LocationSubscriber] sees
pub trait LocationSink: Send + Sync + 'static {
    /// A new location for the tracked entity
    fn on_location(&self, coordinate: Coordinate);
    /// The store has no location for the tracked entity
    fn on_unavailable(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Unknown,
    Available,
    Unavailable,
}

struct ActiveSubscription {
    subscription: SubscriptionId,
    cancel: CancellationToken,
}

/// Rider side of tracking, relays store updates for an entity to a [LocationSink]
pub struct LocationSubscriber<D: LocationStore> {
    store: Arc<D>,
    subscriptions: Mutex<HashMap<WatchHandle, ActiveSubscription>>,
}

impl<D: LocationStore> LocationSubscriber<D> {
    pub fn new(store: Arc<D>) -> Self {
        Self {
            store,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `key`, every update goes to `sink`
    pub async fn start(&self, key: EntityKey, sink: impl LocationSink) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();

        let subscription = self
            .store
            .subscribe(&key, tx)
            .await
            .with_context(|| format!("Failed to subscribe to {key}"))?;

        let handle = WatchHandle::new();
        let cancel = CancellationToken::new();

        info!("Watching location at {key} ({handle})");

        tokio::spawn(Self::relay_loop(key, rx, sink, cancel.clone()));

        self.subscriptions.lock().await.insert(
            handle,
            ActiveSubscription {
                subscription,
                cancel,
            },
        );

        Ok(handle)
    }

    /// Release a subscription, does nothing if `handle` was already stopped or never existed
    pub async fn stop(&self, handle: WatchHandle) {
        let Some(active) = self.subscriptions.lock().await.remove(&handle) else {
            debug!("Ignoring stop for inactive {handle}");
            return;
        };

        active.cancel.cancel();

        if let Err(why) = self.store.unsubscribe(active.subscription).await {
            let err = TrackingError::Teardown(format!("store subscription for {handle}: {why:#}"));
            warn!("{err}");
        }

        info!("Stopped watching location ({handle})");
    }

    /// Number of subscriptions that haven't been stopped
    pub async fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    async fn relay_loop(
        key: EntityKey,
        mut events: mpsc::UnboundedReceiver<StoreEvent>,
        sink: impl LocationSink,
        cancel: CancellationToken,
    ) {
        let mut availability = Availability::Unknown;

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if cancel.is_cancelled() {
                break;
            }

            match event {
                StoreEvent::Value(record) => {
                    if !record.coordinate.is_valid() {
                        warn!("Ignoring out of range location at {key}: {}", record.coordinate);
                        continue;
                    }
                    availability = Availability::Available;
                    sink.on_location(record.coordinate);
                }
                StoreEvent::NoData => {
                    if availability != Availability::Unavailable {
                        info!("No location available at {key}");
                        availability = Availability::Unavailable;
                        sink.on_unavailable();
                    }
                }
                StoreEvent::Error(why) => {
                    warn!("Location updates for {key} errored: {why}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;
    use crate::{
        location::LocationRecord,
        store::MemoryStore,
        tests::{RecordingSink, SinkCall, settle},
    };

    fn bus1() -> EntityKey {
        EntityKey::new("bus1").unwrap()
    }

    fn record(lat: f64, long: f64) -> LocationRecord {
        LocationRecord::new(Coordinate::new(lat, long), chrono::Utc::now())
    }

    fn mk_subscriber() -> (LocationSubscriber<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (LocationSubscriber::new(store.clone()), store)
    }

    #[test]
    async fn test_empty_key_unavailable_once() {
        let (subscriber, _store) = mk_subscriber();
        let sink = RecordingSink::default();

        subscriber.start(bus1(), sink.clone()).await.unwrap();
        settle().await;

        assert_eq!(sink.calls(), vec![SinkCall::Unavailable]);
    }

    #[test]
    async fn test_existing_value_delivered_immediately() {
        let (subscriber, store) = mk_subscriber();
        let sink = RecordingSink::default();
        store.set(&bus1(), record(20.96, 77.75)).await.unwrap();

        subscriber.start(bus1(), sink.clone()).await.unwrap();
        settle().await;

        assert_eq!(
            sink.calls(),
            vec![SinkCall::Location(Coordinate::new(20.96, 77.75))]
        );
    }

    #[test]
    async fn test_updates_in_order() {
        let (subscriber, store) = mk_subscriber();
        let sink = RecordingSink::default();

        subscriber.start(bus1(), sink.clone()).await.unwrap();
        store.set(&bus1(), record(1.0, 2.0)).await.unwrap();
        store.set(&bus1(), record(3.0, 4.0)).await.unwrap();
        settle().await;

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Unavailable,
                SinkCall::Location(Coordinate::new(1.0, 2.0)),
                SinkCall::Location(Coordinate::new(3.0, 4.0)),
            ]
        );
    }

    #[test]
    async fn test_unavailable_deduplicated() {
        let (subscriber, store) = mk_subscriber();
        let sink = RecordingSink::default();

        subscriber.start(bus1(), sink.clone()).await.unwrap();
        // Repeated "no data" from a chatty store
        store.push_raw(&bus1(), StoreEvent::NoData).await;
        store.push_raw(&bus1(), StoreEvent::NoData).await;
        store.set(&bus1(), record(1.0, 2.0)).await.unwrap();
        store.clear(&bus1()).await;
        store.push_raw(&bus1(), StoreEvent::NoData).await;
        settle().await;

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Unavailable,
                SinkCall::Location(Coordinate::new(1.0, 2.0)),
                SinkCall::Unavailable,
            ]
        );
    }

    #[test]
    async fn test_errors_and_bad_records_ignored() {
        let (subscriber, store) = mk_subscriber();
        let sink = RecordingSink::default();
        store.set(&bus1(), record(1.0, 2.0)).await.unwrap();

        subscriber.start(bus1(), sink.clone()).await.unwrap();
        store
            .push_raw(&bus1(), StoreEvent::Error("connection reset".into()))
            .await;
        store
            .push_raw(&bus1(), StoreEvent::Value(record(200.0, 2.0)))
            .await;
        store.set(&bus1(), record(3.0, 4.0)).await.unwrap();
        settle().await;

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Location(Coordinate::new(1.0, 2.0)),
                SinkCall::Location(Coordinate::new(3.0, 4.0)),
            ]
        );
    }

    #[test]
    async fn test_no_leaks_across_start_stop() {
        let (subscriber, store) = mk_subscriber();

        let a = subscriber.start(bus1(), RecordingSink::default()).await.unwrap();
        let b = subscriber.start(bus1(), RecordingSink::default()).await.unwrap();
        let c = subscriber
            .start(EntityKey::new("bus2").unwrap(), RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(store.subscription_count().await, 3);

        subscriber.stop(b).await;
        assert_eq!(store.subscription_count().await, 2);

        subscriber.stop(b).await;
        assert_eq!(store.subscription_count().await, 2);

        subscriber.stop(a).await;
        subscriber.stop(c).await;
        subscriber.stop(c).await;
        assert_eq!(store.subscription_count().await, 0);
        assert_eq!(subscriber.active_subscriptions().await, 0);
    }

    #[test]
    async fn test_no_callbacks_after_stop() {
        let (subscriber, store) = mk_subscriber();
        let sink = RecordingSink::default();

        let handle = subscriber.start(bus1(), sink.clone()).await.unwrap();
        settle().await;
        store.set(&bus1(), record(1.0, 2.0)).await.unwrap();
        subscriber.stop(handle).await;
        settle().await;

        assert_eq!(sink.calls(), vec![SinkCall::Unavailable]);
    }
}
