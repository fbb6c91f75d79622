use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use dew_common::{
    advertisement, Clock, Command, ConfigStore, ConfigUpdate, ConfigView, Devices, DeviceInfo,
    DewController, HardwareError, Inbox, NetAction, RuntimeConfig, Snapshot, StatusPayload,
    TableEntryUpdate, Timezone, WirelessTransport, PEER_CONNECTED, PEER_DISCONNECTED,
    TOPIC_ADVERT, TOPIC_CMD, TOPIC_CONFIG, TOPIC_CONFIG_SET, TOPIC_INFO, TOPIC_LOG, TOPIC_PEER,
    TOPIC_STATUS,
};

use crate::sim::{SimHeater, SimSensor, SimWifi, WifiProfile};

const PERSIST_QUEUE_DEPTH: usize = 4;

#[derive(Clone)]
struct AppState {
    inbox: Arc<Inbox>,
    snapshot: Arc<Mutex<Snapshot>>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
}

#[derive(Debug, Deserialize)]
struct PowerQuery {
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkUpdate {
    #[serde(rename = "wifiSSID")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassword", default)]
    wifi_password: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

/// The collaborators the control loop owns on the host.
struct HostHardware {
    sensor: SimSensor,
    heater: SimHeater,
    wifi: SimWifi,
    transport: MqttTransport,
    store: FileStore,
    clock: HostClock,
}

impl HostHardware {
    fn devices(&mut self) -> Devices<'_> {
        Devices {
            sensor: &mut self.sensor,
            heater: &mut self.heater,
            wifi: &mut self.wifi,
            transport: &mut self.transport,
            store: &mut self.store,
            clock: &mut self.clock,
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let app_store = AppStore::new();
    let mut store = FileStore::open(&app_store).await;
    let controller = DewController::load(&mut store);
    let runtime = controller.runtime().clone();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("dew-controller", mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let inbox = Arc::new(Inbox::new());
    spawn_mqtt_loop(mqtt.clone(), inbox.clone(), eventloop);

    let app_state = AppState {
        inbox,
        snapshot: Arc::new(Mutex::new(controller.snapshot(monotonic_ms()))),
    };

    let port = std::env::var("DEW_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let http = HttpServer {
        app_state: app_state.clone(),
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        task: None,
    };

    let hardware = HostHardware {
        sensor: SimSensor::default(),
        heater: SimHeater::default(),
        wifi: SimWifi::new(WifiProfile::from_env()),
        transport: MqttTransport { client: mqtt },
        store,
        clock: HostClock::default(),
    };

    let control = spawn_control_loop(app_state, controller, hardware, http);
    tokio::select! {
        result = control => result.context("control loop task ended")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn spawn_control_loop(
    app_state: AppState,
    mut controller: DewController,
    mut hardware: HostHardware,
    mut http: HttpServer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let hostname = controller.runtime().connectivity.hostname.clone();
        let actions = controller.start(monotonic_ms(), &mut hardware.devices());
        execute_net_actions(actions, &mut http, &hostname).await;

        let mut interval = tokio::time::interval(Duration::from_millis(controller.idle_ms()));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let actions = controller.step(now_ms, &app_state.inbox, &mut hardware.devices());
            let snapshot = controller.snapshot(now_ms);
            *app_state.snapshot.lock().await = snapshot;

            if !actions.is_empty() {
                execute_net_actions(actions, &mut http, &hostname).await;
            }
        }
    })
}

async fn execute_net_actions(actions: Vec<NetAction>, http: &mut HttpServer, hostname: &str) {
    for action in actions {
        match action {
            NetAction::BindHttp => http.rebind().await,
            // No mDNS responder on the host; the OS resolver owns the name.
            NetAction::AnnounceHostname => info!("hostname {hostname}.local"),
            NetAction::SyncTime => debug!("host clock follows the system clock"),
        }
    }
}

struct HttpServer {
    app_state: AppState,
    addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl HttpServer {
    async fn rebind(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }

        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!("failed to bind http server at {}: {err}", self.addr);
                return;
            }
        };

        info!("http listening on http://{}", self.addr);
        let app = router(self.app_state.clone());
        self.task = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!("http server stopped: {err}");
            }
        }));
    }
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config))
        .route("/api/log", get(handle_get_log))
        .route("/api/info", get(handle_get_info))
        .route("/api/heater/toggle", post(handle_toggle_heater))
        .route("/api/power", post(handle_set_power))
        .route("/api/auto", post(handle_auto))
        .route("/api/table", put(handle_put_table))
        .route("/api/network", put(handle_put_network))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot.lock().await.status.clone())
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot.lock().await.config.clone())
}

async fn handle_get_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot.lock().await.info.clone())
}

async fn handle_get_log(State(state): State<AppState>) -> impl IntoResponse {
    let log = state.snapshot.lock().await.log.clone();
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log)
}

async fn handle_toggle_heater(State(state): State<AppState>) -> impl IntoResponse {
    stage_command(&state, Command::ToggleHeater)
}

async fn handle_set_power(
    State(state): State<AppState>,
    Query(query): Query<PowerQuery>,
) -> impl IntoResponse {
    let Some(value) = query.value else {
        return error_response(StatusCode::BAD_REQUEST, "value is required");
    };
    match Command::parse(&format!("power:{value}")) {
        Ok(command) => stage_command(&state, command),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_auto(State(state): State<AppState>) -> impl IntoResponse {
    stage_command(&state, Command::Auto)
}

async fn handle_put_table(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let rows: Vec<TableEntryUpdate> = match serde_json::from_str(&body) {
        Ok(rows) => rows,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid table: {err}"))
        }
    };
    stage_config(
        &state,
        ConfigUpdate {
            table: Some(rows),
            ..ConfigUpdate::default()
        },
    )
}

async fn handle_put_network(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let update: NetworkUpdate = match serde_json::from_str(&body) {
        Ok(update) => update,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid network payload: {err}"),
            )
        }
    };
    if let Some(timezone) = &update.timezone {
        if Timezone::parse(timezone).is_err() {
            return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
        }
    }

    stage_config(
        &state,
        ConfigUpdate {
            wifi_ssid: Some(update.wifi_ssid),
            wifi_password: update.wifi_password,
            timezone: update.timezone,
            ..ConfigUpdate::default()
        },
    )
}

/// Queues a configuration write exactly as a characteristic write would be.
fn stage_config(state: &AppState, update: ConfigUpdate) -> axum::response::Response {
    let text = match update.encode() {
        Ok(text) => text,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    if let Err(err) = ConfigUpdate::decode(&text) {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    if text.len() > state.inbox.config.capacity() {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "configuration payload too large",
        );
    }

    state.inbox.config.write(&text);
    Json(Accepted { accepted: true }).into_response()
}

fn stage_command(state: &AppState, command: Command) -> axum::response::Response {
    state.inbox.command.write(&command.encode());
    Json(Accepted { accepted: true }).into_response()
}

fn spawn_mqtt_loop(client: AsyncClient, inbox: Arc<Inbox>, mut eventloop: EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    stage_mqtt_write(&inbox, &message.topic, &message.payload);
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    for topic in [TOPIC_CONFIG_SET, TOPIC_CMD, TOPIC_PEER] {
                        if let Err(err) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            warn!("mqtt subscribe to {topic} failed: {err}");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn stage_mqtt_write(inbox: &Inbox, topic: &str, payload: &[u8]) {
    match topic {
        TOPIC_CONFIG_SET => {
            if inbox.config.write_bytes(payload) {
                warn!(
                    "config write truncated to {} bytes",
                    inbox.config.capacity()
                );
            }
        }
        TOPIC_CMD => {
            if inbox.command.write_bytes(payload) {
                warn!("command write truncated to {} bytes", inbox.command.capacity());
            }
        }
        TOPIC_PEER => {
            if payload == PEER_CONNECTED.as_bytes() {
                inbox.peers.peer_connected();
            } else if payload == PEER_DISCONNECTED.as_bytes() {
                inbox.peers.peer_disconnected();
            } else {
                warn!("unknown peer event on {topic}");
            }
        }
        _ => {}
    }
}

struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    fn publish<T: Serialize>(&self, topic: &str, retain: bool, body: &T) -> Result<(), HardwareError> {
        let payload =
            serde_json::to_vec(body).map_err(|err| HardwareError::Transport(err.to_string()))?;
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|err| HardwareError::Transport(err.to_string()))
    }
}

impl WirelessTransport for MqttTransport {
    fn notify(&mut self, status: &StatusPayload) -> Result<(), HardwareError> {
        self.publish(TOPIC_STATUS, false, status)
    }

    fn publish_config(&mut self, config: &ConfigView) -> Result<(), HardwareError> {
        self.publish(TOPIC_CONFIG, true, config)
    }

    fn publish_info(&mut self, info: &DeviceInfo) -> Result<(), HardwareError> {
        self.publish(TOPIC_INFO, true, info)
    }

    fn publish_log(&mut self, log: &str) -> Result<(), HardwareError> {
        self.client
            .try_publish(TOPIC_LOG, QoS::AtMostOnce, true, log.to_string())
            .map_err(|err| HardwareError::Transport(err.to_string()))
    }

    fn restart_advertising(&mut self) -> Result<(), HardwareError> {
        self.client
            .try_publish(TOPIC_ADVERT, QoS::AtLeastOnce, true, advertisement())
            .map_err(|err| HardwareError::Transport(err.to_string()))
    }
}

/// In-memory copy of the runtime config; writes are handed to a background
/// task so the control loop never waits on the filesystem.
struct FileStore {
    current: RuntimeConfig,
    load_error: Option<String>,
    writer: mpsc::Sender<RuntimeConfig>,
}

impl FileStore {
    async fn open(app_store: &AppStore) -> Self {
        let (current, load_error) = match app_store.load_runtime_config().await {
            Ok(runtime) => (runtime, None),
            Err(err) => (RuntimeConfig::default(), Some(format!("{err:#}"))),
        };
        Self {
            current,
            load_error,
            writer: app_store.spawn_writer(),
        }
    }
}

impl ConfigStore for FileStore {
    fn load(&mut self) -> Result<RuntimeConfig, HardwareError> {
        if let Some(err) = self.load_error.take() {
            return Err(HardwareError::Storage(err));
        }
        Ok(self.current.clone())
    }

    fn save(&mut self, runtime: &RuntimeConfig) -> Result<(), HardwareError> {
        self.current = runtime.clone();
        self.writer
            .try_send(runtime.clone())
            .map_err(|err| HardwareError::Storage(format!("write queue: {err}")))
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("DEW_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.dewcontroller"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    fn spawn_writer(&self) -> mpsc::Sender<RuntimeConfig> {
        let (tx, mut rx) = mpsc::channel::<RuntimeConfig>(PERSIST_QUEUE_DEPTH);
        let store = self.clone();
        tokio::spawn(async move {
            while let Some(runtime) = rx.recv().await {
                if let Err(err) = store.save_runtime_config(&runtime).await {
                    warn!("failed to persist runtime config: {err:#}");
                }
            }
        });
        tx
    }
}

#[derive(Default)]
struct HostClock {
    zone: Timezone,
}

impl Clock for HostClock {
    fn timestamp(&self) -> String {
        self.zone.local(Utc::now()).format("%H:%M:%S").to_string()
    }

    fn set_timezone(&mut self, timezone: &str) -> Result<(), HardwareError> {
        self.zone =
            Timezone::parse(timezone).map_err(|err| HardwareError::Clock(err.to_string()))?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
