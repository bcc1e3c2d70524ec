use std::collections::HashMap;

use log::debug;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::{
    location::{EntityKey, LocationRecord},
    prelude::*,
};

/// Notification pushed to a store subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// The record currently at the key
    Value(LocationRecord),
    /// Nothing has been written to the key (or it was removed)
    NoData,
    /// The store had trouble delivering updates, the subscription stays open
    Error(String),
}

pub type StoreEventTx = mpsc::UnboundedSender<StoreEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared real-time key-value store that locations are published through. Last write wins.
pub trait LocationStore: Send + Sync + 'static {
    /// Replace the record at `key`
    fn set(&self, key: &EntityKey, record: LocationRecord) -> impl Future<Output = Result> + Send;
    /// Watch `key`. The current value (or [StoreEvent::NoData]) is pushed right away, then every
    /// later change, in write order.
    fn subscribe(
        &self,
        key: &EntityKey,
        events: StoreEventTx,
    ) -> impl Future<Output = Result<SubscriptionId>> + Send;
    /// Stop pushing events for a subscription
    fn unsubscribe(&self, id: SubscriptionId) -> impl Future<Output = Result> + Send;
}

#[derive(Default)]
struct MemoryStoreInner {
    records: HashMap<EntityKey, LocationRecord>,
    subscribers: HashMap<SubscriptionId, (EntityKey, StoreEventTx)>,
    writes: usize,
}

impl MemoryStoreInner {
    fn notify(&mut self, key: &EntityKey, event: StoreEvent) {
        // Receivers that went away without unsubscribing are dropped here
        self.subscribers.retain(|_, (sub_key, tx)| {
            if sub_key != key {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

/// A [LocationStore] that lives in this process
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &EntityKey) -> Option<LocationRecord> {
        self.inner.lock().await.records.get(key).copied()
    }

    /// Remove the record at `key`, subscribers get [StoreEvent::NoData]
    pub async fn clear(&self, key: &EntityKey) {
        let mut inner = self.inner.lock().await;
        if inner.records.remove(key).is_some() {
            inner.notify(key, StoreEvent::NoData);
        }
    }

    /// Number of live subscriptions across all keys
    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Number of times [LocationStore::set] was called
    pub async fn write_count(&self) -> usize {
        self.inner.lock().await.writes
    }

    /// Push an arbitrary event to subscribers of `key`, for simulating a misbehaving store
    #[cfg(test)]
    pub(crate) async fn push_raw(&self, key: &EntityKey, event: StoreEvent) {
        self.inner.lock().await.notify(key, event);
    }
}

impl LocationStore for MemoryStore {
    async fn set(&self, key: &EntityKey, record: LocationRecord) -> Result {
        let mut inner = self.inner.lock().await;
        inner.writes += 1;
        inner.records.insert(key.clone(), record);
        inner.notify(key, StoreEvent::Value(record));
        Ok(())
    }

    async fn subscribe(&self, key: &EntityKey, events: StoreEventTx) -> Result<SubscriptionId> {
        let mut inner = self.inner.lock().await;

        let initial = inner
            .records
            .get(key)
            .map_or(StoreEvent::NoData, |record| StoreEvent::Value(*record));

        events
            .send(initial)
            .ok()
            .context("Subscriber hung up before subscribing")?;

        let id = SubscriptionId::new();
        inner.subscribers.insert(id, (key.clone(), events));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result {
        if self.inner.lock().await.subscribers.remove(&id).is_none() {
            debug!("Unsubscribe for unknown subscription {id:?}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;
    use crate::location::Coordinate;

    fn record(lat: f64, long: f64) -> LocationRecord {
        LocationRecord::new(Coordinate::new(lat, long), chrono::Utc::now())
    }

    #[test]
    async fn test_subscribe_empty_key() {
        let store = MemoryStore::new();
        let key = EntityKey::new("bus1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        store.subscribe(&key, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(StoreEvent::NoData));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    async fn test_subscribe_existing_then_updates() {
        let store = MemoryStore::new();
        let key = EntityKey::new("bus1").unwrap();
        let other = EntityKey::new("bus2").unwrap();
        let first = record(1.0, 1.0);
        let second = record(2.0, 2.0);

        store.set(&key, first).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = store.subscribe(&key, tx).await.unwrap();

        store.set(&other, record(9.0, 9.0)).await.unwrap();
        store.set(&key, second).await.unwrap();
        store.clear(&key).await;

        assert_eq!(rx.recv().await, Some(StoreEvent::Value(first)));
        assert_eq!(rx.recv().await, Some(StoreEvent::Value(second)));
        assert_eq!(rx.recv().await, Some(StoreEvent::NoData));

        store.unsubscribe(id).await.unwrap();
        store.set(&key, first).await.unwrap();

        assert_eq!(rx.recv().await, None, "Sender should be dropped on unsubscribe");
        assert_eq!(store.write_count().await, 4);
    }

    #[test]
    async fn test_dropped_receivers_are_pruned() {
        let store = MemoryStore::new();
        let key = EntityKey::new("bus1").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        store.subscribe(&key, tx).await.unwrap();
        assert_eq!(store.subscription_count().await, 1);

        drop(rx);
        store.set(&key, record(1.0, 1.0)).await.unwrap();

        assert_eq!(store.subscription_count().await, 0);
    }
}
