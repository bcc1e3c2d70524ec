use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::CredentialStore,
    error::TrackingError,
    handle::WatchHandle,
    location::{Coordinate, EntityKey},
    permission::{PermissionGate, PermissionLevel, PermissionPrompt, PermissionState, Refresh},
    prelude::*,
    publisher::LocationPublisher,
    sensor::LocationSensor,
    settings::TrackingSettings,
    store::LocationStore,
    subscriber::{LocationSink, LocationSubscriber},
};

/// What the mounted screen does with the location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Driver, shares the device location
    Publisher,
    /// Rider, watches the shared location
    Subscriber,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Inactive,
    /// Waiting on the user to answer the location prompt
    PermissionPending,
    /// Publishing or subscribed
    Active,
}

/// Something the UI should react to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionUpdate {
    StateChanged(LifecycleState),
    /// Location access was refused, explain why tracking can't start. The mount is over, the
    /// user has to mount again to retry.
    PermissionDenied(PermissionLevel),
    /// Publishing was requested without a signed in driver
    SignInRequired,
    /// New location of the tracked entity
    Location(Coordinate),
    /// The tracked entity has no location right now
    Unavailable,
}

pub trait SessionUpdateSender: Send + Sync + 'static {
    fn send_update(&self, update: SessionUpdate);
}

enum SessionMessage {
    Mount(Role, EntityKey),
    Unmount,
    Logout,
    /// Answer to a permission prompt started by the mount with the given generation
    PermissionResolved(u64, PermissionState),
}

/// Cheap handle for posting to a [SessionController] from UI code
#[derive(Clone)]
pub struct SessionHandle(mpsc::Sender<SessionMessage>);

impl SessionHandle {
    async fn post(&self, msg: SessionMessage) -> Result {
        self.0
            .send(msg)
            .await
            .ok()
            .context("Session controller is not running")
    }

    /// A tracking screen was opened. Replaces whatever was mounted before.
    pub async fn mount(&self, role: Role, key: EntityKey) -> Result {
        self.post(SessionMessage::Mount(role, key)).await
    }

    /// The tracking screen was closed
    pub async fn unmount(&self) -> Result {
        self.post(SessionMessage::Unmount).await
    }

    /// Stop tracking and forget the stored credential
    pub async fn logout(&self) -> Result {
        self.post(SessionMessage::Logout).await
    }
}

enum LiveHandle {
    Publishing(WatchHandle),
    Subscribed(WatchHandle),
}

#[derive(Default)]
struct Mount {
    state: LifecycleState,
    key: Option<EntityKey>,
    live: Option<LiveHandle>,
}

/// Forwards subscriber output to the UI while its mount is still the current one
struct MountSink<U: SessionUpdateSender> {
    generation: u64,
    current: Arc<AtomicU64>,
    updates: Arc<U>,
}

impl<U: SessionUpdateSender> MountSink<U> {
    fn send(&self, update: SessionUpdate) {
        if self.current.load(Ordering::Acquire) == self.generation {
            self.updates.send_update(update);
        } else {
            debug!("Dropping {update:?} from an old mount");
        }
    }
}

impl<U: SessionUpdateSender> LocationSink for MountSink<U> {
    fn on_location(&self, coordinate: Coordinate) {
        self.send(SessionUpdate::Location(coordinate));
    }

    fn on_unavailable(&self) {
        self.send(SessionUpdate::Unavailable);
    }
}

/// Owns tracking for one screen at a time. Starts the [LocationPublisher] or
/// [LocationSubscriber] when a screen mounts and makes sure whatever it started is stopped when
/// the screen goes away, the user logs out, or the controller shuts down.
///
/// All input goes through a single queue consumed by [SessionController::main_loop]. Every mount
/// gets a new generation, anything still in flight for an older one (a permission answer, a
/// location update) is dropped.
pub struct SessionController<P, S, D, C, U>
where
    P: PermissionPrompt,
    S: LocationSensor,
    D: LocationStore,
    C: CredentialStore,
    U: SessionUpdateSender,
{
    gate: Arc<PermissionGate<P>>,
    publisher: LocationPublisher<S, D>,
    subscriber: LocationSubscriber<D>,
    credentials: C,
    updates: Arc<U>,
    messages: (mpsc::Sender<SessionMessage>, Mutex<mpsc::Receiver<SessionMessage>>),
    mount: Mutex<Mount>,
    generation: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl<P, S, D, C, U> SessionController<P, S, D, C, U>
where
    P: PermissionPrompt,
    S: LocationSensor,
    D: LocationStore,
    C: CredentialStore,
    U: SessionUpdateSender,
{
    pub fn new(
        prompt: P,
        sensor: Arc<S>,
        store: Arc<D>,
        credentials: C,
        updates: U,
        settings: TrackingSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            gate: Arc::new(PermissionGate::new(prompt)),
            publisher: LocationPublisher::new(sensor, store.clone(), settings),
            subscriber: LocationSubscriber::new(store),
            credentials,
            updates: Arc::new(updates),
            messages: (tx, Mutex::new(rx)),
            mount: Mutex::new(Mount::default()),
            generation: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.messages.0.clone())
    }

    pub async fn state(&self) -> LifecycleState {
        self.mount.lock().await.state
    }

    pub fn gate(&self) -> &PermissionGate<P> {
        &self.gate
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn publisher(&self) -> &LocationPublisher<S, D> {
        &self.publisher
    }

    pub fn subscriber(&self) -> &LocationSubscriber<D> {
        &self.subscriber
    }

    /// Make [SessionController::main_loop] tear down and exit
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Process messages until [SessionController::shutdown], always releases the live watch on
    /// the way out.
    pub async fn main_loop(&self) {
        let mut messages = self.messages.1.lock().await;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                msg = messages.recv() => match msg {
                    Some(msg) => self.handle_message(msg).await,
                    None => break,
                },
            }
        }

        let mut mount = self.mount.lock().await;
        self.teardown(&mut mount).await;
        info!("Session controller stopped");
    }

    async fn handle_message(&self, msg: SessionMessage) {
        let mut mount = self.mount.lock().await;
        match msg {
            SessionMessage::Mount(role, key) => {
                self.teardown(&mut mount).await;
                self.mount_role(&mut mount, role, key).await;
            }
            SessionMessage::Unmount => self.teardown(&mut mount).await,
            SessionMessage::Logout => {
                self.teardown(&mut mount).await;
                if let Err(why) = self.credentials.clear_token().await {
                    error!("Failed to clear credentials on logout: {why:?}");
                }
                info!("Logged out");
            }
            SessionMessage::PermissionResolved(generation, state) => {
                self.permission_resolved(&mut mount, generation, state).await
            }
        }
    }

    fn set_state(&self, mount: &mut Mount, state: LifecycleState) {
        if mount.state != state {
            info!("Session {:?} -> {state:?}", mount.state);
            mount.state = state;
            self.updates.send_update(SessionUpdate::StateChanged(state));
        }
    }

    /// The one place live watches get released
    async fn teardown(&self, mount: &mut Mount) {
        self.generation.fetch_add(1, Ordering::AcqRel);

        match mount.live.take() {
            Some(LiveHandle::Publishing(handle)) => self.publisher.stop(handle).await,
            Some(LiveHandle::Subscribed(handle)) => self.subscriber.stop(handle).await,
            None => {}
        }

        mount.key = None;
        self.set_state(mount, LifecycleState::Inactive);
    }

    async fn signed_in(&self) -> bool {
        match self.credentials.get_token().await {
            Ok(token) => token.is_some_and(|token| !token.is_empty()),
            Err(why) => {
                warn!("Failed to read credentials: {why:?}");
                false
            }
        }
    }

    async fn mount_role(&self, mount: &mut Mount, role: Role, key: EntityKey) {
        let generation = self.generation.load(Ordering::Acquire);

        match role {
            Role::Subscriber => {
                let sink = MountSink {
                    generation,
                    current: self.generation.clone(),
                    updates: self.updates.clone(),
                };
                match self.subscriber.start(key.clone(), sink).await {
                    Ok(handle) => {
                        mount.live = Some(LiveHandle::Subscribed(handle));
                        mount.key = Some(key);
                        self.set_state(mount, LifecycleState::Active);
                    }
                    Err(why) => error!("Failed to watch location at {key}: {why:?}"),
                }
            }
            Role::Publisher => {
                if !self.signed_in().await {
                    warn!("{}", TrackingError::NotAuthenticated);
                    self.updates.send_update(SessionUpdate::SignInRequired);
                    return;
                }

                mount.key = Some(key);
                self.set_state(mount, LifecycleState::PermissionPending);

                let gate = self.gate.clone();
                let tx = self.messages.0.clone();
                tokio::spawn(async move {
                    let state = gate.request_permission(PermissionLevel::Background).await;
                    // Controller may have shut down while the prompt was up
                    tx.send(SessionMessage::PermissionResolved(generation, state))
                        .await
                        .ok();
                });
            }
        }
    }

    /// The level a prompt outcome fell short on
    fn missing_level(state: PermissionState) -> PermissionLevel {
        if state.allows(PermissionLevel::Foreground) {
            PermissionLevel::Background
        } else {
            PermissionLevel::Foreground
        }
    }

    fn deny(&self, mount: &mut Mount, level: PermissionLevel) {
        warn!("{}", TrackingError::PermissionDenied(level));
        mount.key = None;
        self.set_state(mount, LifecycleState::Inactive);
        self.updates.send_update(SessionUpdate::PermissionDenied(level));
    }

    async fn permission_resolved(
        &self,
        mount: &mut Mount,
        generation: u64,
        state: PermissionState,
    ) {
        if generation != self.generation.load(Ordering::Acquire)
            || mount.state != LifecycleState::PermissionPending
        {
            debug!("Dropping permission result for an old mount");
            return;
        }

        let Some(key) = mount.key.clone() else {
            return;
        };

        if !self.gate.satisfies(state, PermissionLevel::Background) {
            self.deny(mount, Self::missing_level(state));
            return;
        }

        match self.publisher.start(key.clone()).await {
            Ok(handle) => {
                mount.live = Some(LiveHandle::Publishing(handle));
                self.set_state(mount, LifecycleState::Active);
            }
            Err(why) => {
                error!("Failed to start publishing to {key}: {why:?}");
                match self.gate.refresh().await {
                    Refresh::Revoked(level) => self.deny(mount, level),
                    Refresh::Unchanged(_) => {
                        mount.key = None;
                        self.set_state(mount, LifecycleState::Inactive);
                    }
                }
            }
        }
    }
}
