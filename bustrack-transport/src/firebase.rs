use std::{collections::HashMap, time::Duration};

use bustrack_logic::{
    EntityKey, LocationRecord, LocationStore, StoreEvent, StoreEventTx, SubscriptionId,
    prelude::*,
};
use log::{debug, info, warn};
use reqwest::{
    Client, Url,
    header::{ACCEPT, CONTENT_TYPE},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{DatabaseEvent, EventStreamDecoder, Snapshot},
    server::FirebaseConfig,
};

/// [LocationStore] backed by a Firebase Realtime Database, written through the REST API and
/// watched with its event stream listeners.
pub struct FirebaseStore {
    config: FirebaseConfig,
    client: Client,
    listeners: Mutex<HashMap<SubscriptionId, CancellationToken>>,
}

impl FirebaseStore {
    pub fn new(config: FirebaseConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(config, client))
    }

    /// Use an already configured HTTP client, e.g. one with custom proxy settings
    pub fn with_client(config: FirebaseConfig, client: Client) -> Self {
        Self {
            config,
            client,
            listeners: Mutex::new(HashMap::with_capacity(1)),
        }
    }

    pub fn config(&self) -> &FirebaseConfig {
        &self.config
    }
}

impl Drop for FirebaseStore {
    fn drop(&mut self) {
        for (_, cancel) in self.listeners.get_mut().drain() {
            cancel.cancel();
        }
    }
}

impl LocationStore for FirebaseStore {
    async fn set(&self, key: &EntityKey, record: LocationRecord) -> Result {
        let url = self.config.key_url(key)?;
        let body = serde_json::to_vec(&record).context("Failed to encode location record")?;

        self.client
            .put(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to reach database")?
            .error_for_status()
            .context("Database rejected write")?;

        Ok(())
    }

    async fn subscribe(&self, key: &EntityKey, events: StoreEventTx) -> Result<SubscriptionId> {
        let url = self.config.key_url(key)?;
        let id = SubscriptionId::new();
        let cancel = CancellationToken::new();

        let listener = Listener {
            client: self.client.clone(),
            url,
            key: key.clone(),
            events,
            cancel: cancel.clone(),
            reconnect_delay: self.config.reconnect_delay(),
            idle_timeout: self.config.idle_timeout(),
        };

        self.listeners.lock().await.insert(id, cancel);
        tokio::spawn(listener.run());

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result {
        if let Some(cancel) = self.listeners.lock().await.remove(&id) {
            cancel.cancel();
        } else {
            debug!("Unsubscribe for unknown listener {id:?}");
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ListenEnd {
    /// Stream closed or was revoked, open a new one
    Reconnect,
    /// Nobody is listening anymore or the database refused us for good
    Stop,
}

struct Listener {
    client: Client,
    url: Url,
    key: EntityKey,
    events: StoreEventTx,
    cancel: CancellationToken,
    reconnect_delay: Duration,
    idle_timeout: Duration,
}

impl Listener {
    async fn run(self) {
        loop {
            let outcome = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                res = self.listen() => res,
            };

            match outcome {
                Ok(ListenEnd::Stop) => break,
                Ok(ListenEnd::Reconnect) => {
                    debug!("Listener for {} ended, reconnecting", self.key);
                }
                Err(why) => {
                    warn!("Listener for {} failed: {why:?}", self.key);
                    if self.events.send(StoreEvent::Error(format!("{why:#}"))).is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Stopped listening to {}", self.key);
    }

    async fn listen(&self) -> Result<ListenEnd> {
        let request = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send();

        let mut resp = tokio::time::timeout(self.idle_timeout, request)
            .await
            .ok()
            .with_context(|| format!("Database didn't answer within {:?}", self.idle_timeout))?
            .context("Failed to reach database")?
            .error_for_status()
            .context("Database refused listener")?;

        info!("Listening to {}", self.key);

        let mut decoder = EventStreamDecoder::default();
        let mut snapshot = Snapshot::default();

        loop {
            // Keep-alives arrive well within the limit, silence means the connection is gone
            let chunk = tokio::time::timeout(self.idle_timeout, resp.chunk())
                .await
                .ok()
                .with_context(|| format!("Event stream silent for {:?}", self.idle_timeout))?
                .context("Event stream interrupted")?;

            let Some(chunk) = chunk else {
                break;
            };

            for event in decoder.push(&chunk) {
                match DatabaseEvent::try_from(event) {
                    Ok(event) => {
                        if let Some(end) = apply_event(event, &mut snapshot, &self.events) {
                            return Ok(end);
                        }
                    }
                    Err(why) => warn!("Ignoring event for {}: {why:?}", self.key),
                }
            }
        }

        Ok(ListenEnd::Reconnect)
    }
}

fn apply_event(
    event: DatabaseEvent,
    snapshot: &mut Snapshot,
    events: &StoreEventTx,
) -> Option<ListenEnd> {
    let notify = |update: StoreEvent| {
        if events.send(update).is_err() {
            Some(ListenEnd::Stop)
        } else {
            None
        }
    };

    match event {
        DatabaseEvent::Put { path, data } => {
            snapshot.put(&path, data);
        }
        DatabaseEvent::Patch { path, data } => {
            if let Err(why) = snapshot.patch(&path, data) {
                return notify(StoreEvent::Error(format!("{why:#}")));
            }
        }
        DatabaseEvent::KeepAlive => return None,
        DatabaseEvent::Cancel(why) => {
            events
                .send(StoreEvent::Error(format!("Listener cancelled by database: {why}")))
                .ok();
            return Some(ListenEnd::Stop);
        }
        DatabaseEvent::AuthRevoked(why) => {
            return notify(StoreEvent::Error(format!("Database credential revoked: {why}")))
                .or(Some(ListenEnd::Reconnect));
        }
    }

    let update = match snapshot.record() {
        Ok(Some(record)) => StoreEvent::Value(record),
        Ok(None) => StoreEvent::NoData,
        Err(why) => StoreEvent::Error(format!("{why:#}")),
    };

    notify(update)
}
