use std::{
    collections::{HashMap, HashSet},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bustrack_logic::{
    Coordinate, CredentialStore, LocationSample, LocationSensor, LocationStore, MemoryStore,
    PermissionLevel, PermissionPrompt, SensorEvent, SensorEventTx, SensorWatchId,
    SessionController, SessionUpdate, SessionUpdateSender, TrackingSettings, WatchOptions,
};
use bustrack_test_shared::*;
use bustrack_transport::{FirebaseConfig, FirebaseStore, database_reachable};
use chrono::Utc;
use clap::Parser;
use interprocess::local_socket::{ListenerOptions, tokio::prelude::*};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

#[derive(Parser)]
struct Cli {
    /// Name of the local socket to listen for a driver on
    socket: String,

    /// Keep locations in this process instead of a realtime database
    #[arg(long)]
    memory: bool,

    /// Realtime database to use, defaults to the emulator
    #[arg(long)]
    database_url: Option<String>,

    /// Database name, needed by the emulator
    #[arg(long)]
    namespace: Option<String>,

    /// Token sent with database requests
    #[arg(long)]
    auth_token: Option<String>,

    /// Where the driver credential is kept between runs
    #[arg(long, default_value = "bustrack-credentials.json")]
    credentials: PathBuf,

    /// JSON file of tracking settings, missing fields use defaults
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Act like a platform that has no separate background location permission
    #[arg(long)]
    no_background_permission: bool,

    /// Move the simulated device a little from its last sample every N seconds
    #[arg(long, value_name = "SECONDS")]
    wander: Option<u64>,

    /// Position the simulated device starts at, lets `--wander` run before any sample is sent
    #[arg(long, num_args = 2, value_names = ["LAT", "LON"], allow_negative_numbers = true)]
    start: Option<Vec<f64>>,
}

impl Cli {
    fn firebase_config(&self) -> FirebaseConfig {
        let mut config = FirebaseConfig::default();
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        if self.namespace.is_some() {
            config.namespace = self.namespace.clone();
        }
        config.auth_token = self.auth_token.clone();
        config
    }

    fn start(&self) -> Result<Option<Coordinate>> {
        let Some(&[latitude, longitude]) = self.start.as_deref() else {
            return Ok(None);
        };
        let coordinate = Coordinate::new(latitude, longitude);
        coordinate.validate().context("Invalid start position")?;
        Ok(Some(coordinate))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Permission prompt whose answers are set by the driver
struct ScriptedPrompt {
    supports_background: bool,
    answers: Mutex<PromptAnswers>,
    revoked: Mutex<HashSet<PermissionLevel>>,
}

impl ScriptedPrompt {
    fn new(supports_background: bool) -> Self {
        Self {
            supports_background,
            answers: Mutex::new(PromptAnswers::default()),
            revoked: Mutex::new(HashSet::with_capacity(2)),
        }
    }

    fn set_answers(&self, answers: PromptAnswers) {
        *lock(&self.answers) = answers;
    }

    fn revoke(&self, level: PermissionLevel) {
        lock(&self.revoked).insert(level);
    }
}

impl PermissionPrompt for ScriptedPrompt {
    fn supports_background(&self) -> bool {
        self.supports_background
    }

    async fn request(&self, level: PermissionLevel) -> Result<bool> {
        let granted = lock(&self.answers).answer(level);
        info!("Prompted for {level:?}, answering {granted}");
        if granted {
            lock(&self.revoked).remove(&level);
        }
        Ok(granted)
    }

    async fn check(&self, level: PermissionLevel) -> Result<bool> {
        let revoked = lock(&self.revoked).contains(&level);
        Ok(lock(&self.answers).answer(level) && !revoked)
    }
}

#[derive(Default)]
struct SensorInner {
    next_id: u64,
    watches: HashMap<SensorWatchId, SensorEventTx>,
    last: Option<Coordinate>,
}

/// Sensor that reports whatever the driver says the device's position is
#[derive(Default)]
struct SimulatedSensor {
    inner: Mutex<SensorInner>,
}

impl SimulatedSensor {
    const WANDER_DEGREES: f64 = 0.0002;

    fn starting_at(start: Option<Coordinate>) -> Self {
        Self {
            inner: Mutex::new(SensorInner {
                last: start,
                ..Default::default()
            }),
        }
    }

    fn broadcast(inner: &SensorInner, event: SensorEvent) {
        for tx in inner.watches.values() {
            tx.send(event.clone()).ok();
        }
    }

    fn emit(&self, coordinate: Coordinate) {
        let mut inner = lock(&self.inner);
        inner.last = Some(coordinate);
        Self::broadcast(
            &inner,
            SensorEvent::Sample(LocationSample {
                coordinate,
                timestamp: Utc::now(),
            }),
        );
    }

    fn emit_error(&self, why: String) {
        Self::broadcast(&lock(&self.inner), SensorEvent::Error(why));
    }

    /// Nudge the last reported position by a random amount
    fn wander(&self) {
        let last = lock(&self.inner).last;
        if let Some(last) = last {
            let next = Coordinate::new(
                (last.latitude + rand::random_range(-Self::WANDER_DEGREES..Self::WANDER_DEGREES))
                    .clamp(-90.0, 90.0),
                (last.longitude + rand::random_range(-Self::WANDER_DEGREES..Self::WANDER_DEGREES))
                    .clamp(-180.0, 180.0),
            );
            debug!("Wandered to {next}");
            self.emit(next);
        }
    }
}

impl LocationSensor for SimulatedSensor {
    fn watch_position(
        &self,
        options: WatchOptions,
        events: SensorEventTx,
    ) -> Result<SensorWatchId> {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = SensorWatchId(inner.next_id);
        inner.watches.insert(id, events);
        info!("Sensor watch {} started with {options:?}", id.0);
        Ok(id)
    }

    fn clear_watch(&self, id: SensorWatchId) -> Result {
        if lock(&self.inner).watches.remove(&id).is_none() {
            bail!("No sensor watch {}", id.0);
        }
        info!("Sensor watch {} cleared", id.0);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    token: String,
}

/// Keeps the driver credential in a JSON file so it survives restarts
struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialStore for FileCredentials {
    async fn get_token(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let stored = serde_json::from_str::<StoredCredential>(&raw)
                    .context("Failed to parse credentials file")?;
                Ok(Some(stored.token))
            }
            Err(why) if why.kind() == ErrorKind::NotFound => Ok(None),
            Err(why) => Err(why).context("Failed to read credentials file"),
        }
    }

    async fn set_token(&self, token: &str) -> Result {
        let stored = StoredCredential {
            token: token.to_string(),
        };
        let encoded = serde_json::to_vec(&stored).context("Failed to encode credentials")?;
        tokio::fs::write(&self.path, encoded)
            .await
            .context("Failed to write credentials file")
    }

    async fn clear_token(&self) -> Result {
        match tokio::fs::remove_file(&self.path).await {
            Err(why) if why.kind() != ErrorKind::NotFound => {
                Err(why).context("Failed to remove credentials file")
            }
            _ => Ok(()),
        }
    }
}

struct UpdateSender(mpsc::Sender<TestingResponse>);

impl SessionUpdateSender for UpdateSender {
    fn send_update(&self, update: SessionUpdate) {
        if let Err(why) = self.0.try_send(update.into()) {
            debug!("Dropping update, no driver is reading: {why}");
        }
    }
}

type Controller<D> =
    SessionController<ScriptedPrompt, SimulatedSensor, D, FileCredentials, UpdateSender>;

async fn process_req<D: LocationStore>(
    controller: &Controller<D>,
    sensor: &SimulatedSensor,
    req: TestingRequest,
) -> Result {
    let session = controller.handle();
    match req {
        TestingRequest::Login(token) => controller.credentials().set_token(&token).await?,
        TestingRequest::Logout => session.logout().await?,
        TestingRequest::Mount(role, key) => session.mount(role, key).await?,
        TestingRequest::Unmount => session.unmount().await?,
        TestingRequest::SetPermissions(answers) => controller.gate().prompt().set_answers(answers),
        TestingRequest::Revoke(level) => controller.gate().prompt().revoke(level),
        TestingRequest::Sample(coordinate) => sensor.emit(coordinate),
        TestingRequest::SensorError(why) => sensor.emit_error(why),
    }
    Ok(())
}

async fn send_resp(send: &mut &LocalSocketStream, resp: &TestingResponse) -> Result {
    let mut encoded = serde_json::to_vec(resp).context("Failed to encode response")?;
    encoded.push(b'\n');
    send.write_all(&encoded)
        .await
        .context("Failed to send response")
}

async fn load_settings(path: &Path) -> Result<TrackingSettings> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read settings file")?;
    serde_json::from_str(&raw).context("Failed to parse settings file")
}

async fn run<D: LocationStore>(
    cli: Cli,
    listener: LocalSocketListener,
    store: D,
    settings: TrackingSettings,
) -> Result {
    let sensor = Arc::new(SimulatedSensor::starting_at(cli.start()?));
    let (resp_tx, mut resp_rx) = mpsc::channel::<TestingResponse>(40);

    let controller = Arc::new(Controller::new(
        ScriptedPrompt::new(!cli.no_background_permission),
        sensor.clone(),
        Arc::new(store),
        FileCredentials::new(cli.credentials),
        UpdateSender(resp_tx),
        settings,
    ));

    let main_loop = tokio::spawn({
        let controller = controller.clone();
        async move { controller.main_loop().await }
    });

    let wander = cli.wander.map(|secs| {
        let sensor = sensor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                interval.tick().await;
                sensor.wander();
            }
        })
    });

    info!("Testing daemon ready");

    'server: loop {
        let res = tokio::select! {
            res = listener.accept() => res,
            Ok(_) = tokio::signal::ctrl_c() => break 'server,
        };

        let stream = match res {
            Ok(stream) => stream,
            Err(why) => {
                error!("Error from connection: {why:?}");
                continue;
            }
        };

        info!("Driver connected");

        let mut recv = BufReader::new(&stream);
        let mut send = &stream;
        let mut buffer = String::with_capacity(256);

        loop {
            let resp = tokio::select! {
                Ok(_) = tokio::signal::ctrl_c() => break 'server,

                res = recv.read_line(&mut buffer) => match res {
                    Ok(0) => break,
                    Ok(_) => {
                        let resp = match serde_json::from_str::<TestingRequest>(&buffer) {
                            Ok(req) => {
                                debug!("Request: {req:?}");
                                let res = process_req(&controller, &sensor, req).await;
                                res.map_or_else(TestingResponse::from, |_| {
                                    TestingResponse::Complete
                                })
                            }
                            Err(why) => TestingResponse::Error(format!("Bad request: {why}")),
                        };
                        buffer.clear();
                        resp
                    }
                    Err(why) => {
                        warn!("Read error: {why:?}");
                        break;
                    }
                },

                Some(resp) = resp_rx.recv() => resp,
            };

            if let Err(why) = send_resp(&mut send, &resp).await {
                warn!("Dropping driver: {why:?}");
                break;
            }
        }

        info!("Driver disconnected");
    }

    if let Some(wander) = wander {
        wander.abort();
    }

    controller.shutdown();
    main_loop.await.context("Session controller panicked")?;

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result {
    colog::init();

    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => load_settings(path).await?,
        None => TrackingSettings::default(),
    };

    let socket_name = get_socket_name(cli.socket.clone())?;
    let listener = ListenerOptions::new()
        .name(socket_name)
        .create_tokio()
        .context("Failed to bind to socket")?;

    if cli.memory {
        info!("Using in-memory store");
        run(cli, listener, MemoryStore::new(), settings).await
    } else {
        let config = cli.firebase_config();
        match database_reachable(&config).await {
            Ok(true) => info!("Using database at {}", config.database_url),
            Ok(false) => warn!("Database at {} answered with an error", config.database_url),
            Err(why) => warn!("Database at {} is unreachable: {why:?}", config.database_url),
        }
        let store = FirebaseStore::new(config)?;
        run(cli, listener, store, settings).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;

    #[test]
    async fn test_scripted_prompt_revoke() {
        let prompt = ScriptedPrompt::new(true);
        assert!(prompt.check(PermissionLevel::Foreground).await.unwrap());

        prompt.revoke(PermissionLevel::Foreground);
        assert!(!prompt.check(PermissionLevel::Foreground).await.unwrap());

        assert!(prompt.request(PermissionLevel::Foreground).await.unwrap());
        assert!(prompt.check(PermissionLevel::Foreground).await.unwrap());

        prompt.set_answers(PromptAnswers {
            foreground: true,
            background: false,
        });
        assert!(!prompt.request(PermissionLevel::Background).await.unwrap());
    }

    #[test]
    async fn test_simulated_sensor() {
        let sensor = SimulatedSensor::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = sensor
            .watch_position(
                WatchOptions {
                    min_distance_meters: 0.0,
                    high_accuracy: true,
                },
                tx,
            )
            .unwrap();

        sensor.wander();
        assert!(rx.try_recv().is_err(), "Nothing to wander from yet");

        sensor.emit(Coordinate::new(20.96, 77.75));
        sensor.wander();

        let Some(SensorEvent::Sample(first)) = rx.recv().await else {
            panic!("Expected a sample");
        };
        let Some(SensorEvent::Sample(second)) = rx.recv().await else {
            panic!("Expected a sample");
        };
        assert_eq!(first.coordinate, Coordinate::new(20.96, 77.75));
        assert!(second.coordinate.distance_meters(&first.coordinate) < 50.0);

        sensor.clear_watch(id).unwrap();
        assert!(sensor.clear_watch(id).is_err());
    }

    #[test]
    async fn test_file_credentials() {
        let path = std::env::temp_dir().join(format!(
            "bustrack-credentials-{}-{}.json",
            std::process::id(),
            rand::random_range(0..u32::MAX)
        ));
        let creds = FileCredentials::new(path.clone());

        assert_eq!(creds.get_token().await.unwrap(), None);
        creds.set_token("driver-token").await.unwrap();
        assert_eq!(
            creds.get_token().await.unwrap(),
            Some("driver-token".to_string())
        );
        creds.clear_token().await.unwrap();
        creds.clear_token().await.unwrap();
        assert_eq!(creds.get_token().await.unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    async fn test_wander_from_start() {
        let sensor = SimulatedSensor::starting_at(Some(Coordinate::new(-33.86, 151.2)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sensor
            .watch_position(
                WatchOptions {
                    min_distance_meters: 0.0,
                    high_accuracy: true,
                },
                tx,
            )
            .unwrap();

        assert!(rx.try_recv().is_err(), "Starting position isn't a sample");

        sensor.wander();
        let Some(SensorEvent::Sample(sample)) = rx.recv().await else {
            panic!("Expected a sample");
        };
        assert!(sample.coordinate.distance_meters(&Coordinate::new(-33.86, 151.2)) < 50.0);
    }

    #[test]
    async fn test_start_option() {
        let cli = Cli::parse_from(["daemon", "sock", "--start", "-33.86", "151.2"]);
        assert_eq!(cli.start().unwrap(), Some(Coordinate::new(-33.86, 151.2)));

        let cli = Cli::parse_from(["daemon", "sock"]);
        assert_eq!(cli.start().unwrap(), None);

        let cli = Cli::parse_from(["daemon", "sock", "--start", "91", "0"]);
        assert!(cli.start().is_err());
    }

    #[test]
    async fn test_updates_dropped_when_driver_lags() {
        let (tx, mut rx) = mpsc::channel(2);
        let sender = UpdateSender(tx);

        sender.send_update(SessionUpdate::SignInRequired);
        sender.send_update(SessionUpdate::SignInRequired);
        sender.send_update(SessionUpdate::SignInRequired);

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "Overflow should be dropped");

        sender.send_update(SessionUpdate::SignInRequired);
        assert!(rx.recv().await.is_some());
    }
}
