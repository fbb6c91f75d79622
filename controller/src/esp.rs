use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use dht_sensor::dht22;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, Gpio5, IOPin, InputOutput, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{config::ScanConfig, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use dew_common::{
    advertisement, Clock, Command, ConfigStore, ConfigUpdate, ConfigView, Devices, DeviceInfo,
    DewController, EnvironmentSensor, HardwareError, HeaterOutput, Inbox, LinkStatus, NetAction,
    NetworkConfig, Reading, RuntimeConfig, ScanStatus, Snapshot, StationCredentials,
    StatusPayload, TableEntryUpdate, Timezone, WifiDriver, WirelessTransport, PEER_CONNECTED,
    PEER_DISCONNECTED, TOPIC_ADVERT, TOPIC_CMD, TOPIC_CONFIG, TOPIC_CONFIG_SET, TOPIC_INFO,
    TOPIC_LOG, TOPIC_PEER, TOPIC_STATUS,
};

const NVS_NAMESPACE: &str = "dewctl";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const HEATER_PWM_HZ: u32 = 1_000;
// 2023-01-01T00:00:00Z; anything earlier means SNTP has not synced yet.
const MIN_SYNCED_EPOCH_S: i64 = 1_672_531_200;

#[derive(Clone)]
struct SharedState {
    inbox: Arc<Inbox>,
    snapshot: Arc<Mutex<Snapshot>>,
}

impl SharedState {
    fn snapshot(&self) -> MutexGuard<'_, Snapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: bool,
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

struct DeviceHardware {
    sensor: Dht22Sensor,
    heater: LedcHeater,
    wifi: EspRadio,
    transport: MqttTransport,
    store: NvsStore,
    clock: DeviceClock,
}

impl DeviceHardware {
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

/// Services that are (re)started from the control loop as connectivity changes.
#[derive(Default)]
struct NetServices {
    http: Option<EspHttpServer<'static>>,
    sntp: Option<EspSntp<'static>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore {
        partition: nvs_partition.clone(),
    };
    let controller = DewController::load(&mut store);
    let network = controller.runtime().network.clone();

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, tz=`{}`",
        network.wifi_ssid,
        network.mqtt_host,
        network.mqtt_port,
        controller.runtime().timezone,
    );

    let Peripherals {
        modem, pins, ledc, ..
    } = Peripherals::take()?;

    let sensor = Dht22Sensor::new(pins.gpio4.downgrade()).context("DHT22 init failed")?;
    let heater = LedcHeater::new(ledc, pins.gpio5).context("heater PWM init failed")?;
    let wifi = EspRadio::new(modem, sys_loop, nvs_partition).context("wifi init failed")?;

    let inbox = Arc::new(Inbox::new());
    let (mqtt_client, mqtt_conn) = create_mqtt_client(&network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    spawn_mqtt_receiver(inbox.clone(), mqtt_conn, mqtt_client.clone());

    let state = SharedState {
        inbox,
        snapshot: Arc::new(Mutex::new(controller.snapshot(monotonic_ms()))),
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let hardware = DeviceHardware {
        sensor,
        heater,
        wifi,
        transport: MqttTransport {
            client: mqtt_client,
        },
        store,
        clock: DeviceClock::default(),
    };

    run_control_loop(state, controller, hardware)
}

fn run_control_loop(
    state: SharedState,
    mut controller: DewController,
    mut hardware: DeviceHardware,
) -> anyhow::Result<()> {
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let hostname = controller.runtime().connectivity.hostname.clone();
    let mut services = NetServices::default();

    let actions = controller.start(monotonic_ms(), &mut hardware.devices());
    execute_net_actions(actions, &state, &mut services, &mut hardware.wifi, &hostname);

    loop {
        feed_watchdog();
        let now_ms = monotonic_ms();

        let actions = controller.step(now_ms, &state.inbox, &mut hardware.devices());
        *state.snapshot() = controller.snapshot(now_ms);
        execute_net_actions(actions, &state, &mut services, &mut hardware.wifi, &hostname);

        thread::sleep(Duration::from_millis(controller.idle_ms()));
    }
}

fn execute_net_actions(
    actions: Vec<NetAction>,
    state: &SharedState,
    services: &mut NetServices,
    wifi: &mut EspRadio,
    hostname: &str,
) {
    for action in actions {
        match action {
            NetAction::BindHttp => {
                // The old listener must release its socket before binding again.
                services.http = None;
                match create_http_server(state.clone()) {
                    Ok(server) => {
                        info!("http server listening");
                        services.http = Some(server);
                    }
                    Err(err) => warn!("failed to start http server: {err:#}"),
                }
            }
            NetAction::AnnounceHostname => match wifi.set_hostname(hostname) {
                Ok(()) => info!("hostname set to `{hostname}`"),
                Err(err) => warn!("failed to set hostname: {err:#}"),
            },
            NetAction::SyncTime => {
                if services.sntp.is_some() {
                    continue;
                }
                match EspSntp::new_default() {
                    Ok(sntp) => {
                        info!("SNTP initialized");
                        services.sntp = Some(sntp);
                    }
                    Err(err) => warn!("failed to start SNTP: {err:?}"),
                }
            }
        }
    }
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = state.snapshot().status.clone();
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let config = state.snapshot().config.clone();
            write_json(req, &config)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/info", Method::Get, move |req| {
            let info = state.snapshot().info.clone();
            write_json(req, &info)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/log", Method::Get, move |req| {
            let log = state.snapshot().log.clone();
            req.into_response(200, Some("OK"), &[("Content-Type", "text/plain; charset=utf-8")])?
                .write_all(log.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/heater/toggle", Method::Post, move |req| {
            state.inbox.command.write(&Command::ToggleHeater.encode());
            write_json(req, &Accepted { accepted: true })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/power", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(value) = query_param(&uri, "value") else {
                return write_error(req, 400, "Missing 'value' parameter");
            };
            match Command::parse(&format!("power:{value}")) {
                Ok(command) => {
                    state.inbox.command.write(&command.encode());
                    write_json(req, &Accepted { accepted: true })
                }
                Err(err) => write_error(req, 400, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/auto", Method::Post, move |req| {
            state.inbox.command.write(&Command::Auto.encode());
            write_json(req, &Accepted { accepted: true })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/table", Method::Put, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 413, &err.to_string()),
            };
            let rows = match serde_json::from_slice::<Vec<TableEntryUpdate>>(&body) {
                Ok(rows) => rows,
                Err(err) => return write_error(req, 400, &format!("invalid table: {err}")),
            };
            let update = ConfigUpdate {
                table: Some(rows),
                ..ConfigUpdate::default()
            };
            match stage_config(&state, &update) {
                Ok(()) => write_json(req, &Accepted { accepted: true }),
                Err((status, message)) => write_error(req, status, &message),
            }
        })?;
    }

    server.fn_handler("/api/network", Method::Put, move |mut req| {
        let body = match read_request_body(&mut req) {
            Ok(body) => body,
            Err(err) => return write_error(req, 413, &err.to_string()),
        };
        let network = match serde_json::from_slice::<NetworkUpdate>(&body) {
            Ok(network) => network,
            Err(err) => {
                return write_error(req, 400, &format!("invalid network payload: {err}"))
            }
        };
        if let Some(timezone) = &network.timezone {
            if Timezone::parse(timezone).is_err() {
                return write_error(req, 400, "Invalid timezone value");
            }
        }

        let update = ConfigUpdate {
            wifi_ssid: Some(network.wifi_ssid),
            wifi_password: network.wifi_password,
            timezone: network.timezone,
            ..ConfigUpdate::default()
        };
        match stage_config(&state, &update) {
            Ok(()) => write_json(req, &Accepted { accepted: true }),
            Err((status, message)) => write_error(req, status, &message),
        }
    })?;

    Ok(server)
}

/// Queues a configuration write exactly as a characteristic write would be.
fn stage_config(state: &SharedState, update: &ConfigUpdate) -> Result<(), (u16, String)> {
    let text = update.encode().map_err(|err| (400, err.to_string()))?;
    ConfigUpdate::decode(&text).map_err(|err| (400, err.to_string()))?;
    if text.len() > state.inbox.config.capacity() {
        return Err((413, "configuration payload too large".to_string()));
    }
    state.inbox.config.write(&text);
    Ok(())
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("dew-controller"),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in [TOPIC_CONFIG_SET, TOPIC_CMD, TOPIC_PEER] {
        mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    }

    Ok(())
}

/// Receives characteristic writes from the bridge. Payloads only ever land in
/// the inbox; the control loop does the decoding.
fn spawn_mqtt_receiver(
    inbox: Arc<Inbox>,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = subscribe_topics(&mqtt) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        stage_mqtt_write(&inbox, topic, data);
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn stage_mqtt_write(inbox: &Inbox, topic: &str, payload: &[u8]) {
    match topic {
        TOPIC_CONFIG_SET => {
            if inbox.config.write_bytes(payload) {
                warn!("config write truncated to {} bytes", inbox.config.capacity());
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
    client: Arc<Mutex<EspMqttClient<'static>>>,
}

impl MqttTransport {
    fn publish_raw(&self, topic: &str, retain: bool, payload: &[u8]) -> Result<(), HardwareError> {
        let mut client = self
            .client
            .lock()
            .map_err(|_| HardwareError::Transport("mqtt client lock poisoned".to_string()))?;
        client
            .publish(topic, QoS::AtMostOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| HardwareError::Transport(format!("{err:?}")))
    }

    fn publish<T: Serialize>(&self, topic: &str, retain: bool, body: &T) -> Result<(), HardwareError> {
        let payload =
            serde_json::to_vec(body).map_err(|err| HardwareError::Transport(err.to_string()))?;
        self.publish_raw(topic, retain, &payload)
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
        self.publish_raw(TOPIC_LOG, true, log.as_bytes())
    }

    fn restart_advertising(&mut self) -> Result<(), HardwareError> {
        self.publish_raw(TOPIC_ADVERT, true, advertisement().as_bytes())
    }
}

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }
}

impl EnvironmentSensor for Dht22Sensor {
    fn read_environment(&mut self) -> Result<Reading, HardwareError> {
        self.pin
            .set_high()
            .map_err(|err| HardwareError::Sensor(format!("DHT22 line: {err:?}")))?;
        let reading = dht22::blocking::read(&mut self.delay, &mut self.pin)
            .map_err(|err| HardwareError::Sensor(format!("DHT22 read: {err:?}")))?;
        Ok(Reading {
            temperature_c: reading.temperature,
            humidity: reading.relative_humidity,
        })
    }
}

struct LedcHeater {
    channel: LedcDriver<'static>,
    max_duty: u32,
}

impl LedcHeater {
    fn new(ledc: LEDC, pin: Gpio5) -> anyhow::Result<Self> {
        let timer = LedcTimerDriver::new(
            ledc.timer0,
            &TimerConfig {
                frequency: Hertz(HEATER_PWM_HZ),
                resolution: Resolution::Bits10,
                ..Default::default()
            },
        )?;
        let mut channel = LedcDriver::new(ledc.channel0, timer, pin)?;
        channel.set_duty(0)?;
        let max_duty = channel.get_max_duty();
        Ok(Self { channel, max_duty })
    }
}

impl HeaterOutput for LedcHeater {
    fn set_power(&mut self, percent: u8) -> Result<(), HardwareError> {
        let duty = self.max_duty * u32::from(percent.min(100)) / 100;
        self.channel
            .set_duty(duty)
            .map_err(|err| HardwareError::Output(format!("LEDC duty {duty}: {err}")))
    }
}

/// Station + access point radio driven without blocking the control loop.
struct EspRadio {
    wifi: EspWifi<'static>,
    station: Option<ClientConfiguration>,
    access_point: Option<AccessPointConfiguration>,
    scan_target: Option<String>,
}

impl EspRadio {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            wifi: EspWifi::new(modem, sys_loop, Some(nvs_partition))?,
            station: None,
            access_point: None,
            scan_target: None,
        })
    }

    fn set_hostname(&mut self, hostname: &str) -> anyhow::Result<()> {
        self.wifi.sta_netif_mut().set_hostname(hostname)?;
        Ok(())
    }

    fn apply(&mut self) -> Result<(), HardwareError> {
        let configuration = match (&self.station, &self.access_point) {
            (Some(station), Some(ap)) => Configuration::Mixed(station.clone(), ap.clone()),
            (None, Some(ap)) => Configuration::Mixed(ClientConfiguration::default(), ap.clone()),
            (Some(station), None) => Configuration::Client(station.clone()),
            (None, None) => Configuration::None,
        };
        self.wifi.set_configuration(&configuration).map_err(wifi_error)?;
        if !self.wifi.is_started().map_err(wifi_error)? {
            self.wifi.start().map_err(wifi_error)?;
        }
        Ok(())
    }
}

impl WifiDriver for EspRadio {
    fn begin_station(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError> {
        self.station = Some(client_configuration(credentials)?);
        self.apply()?;
        disable_wifi_power_save();
        info!("wifi started, connecting to `{}`", credentials.ssid);
        self.wifi.connect().map_err(wifi_error)
    }

    fn link(&mut self) -> LinkStatus {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        if rc != esp_idf_svc::sys::ESP_OK {
            return LinkStatus::default();
        }

        let ip = self
            .wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified());
        LinkStatus {
            associated: true,
            rssi: Some(ap_info.rssi),
            ip,
        }
    }

    fn reconnect(&mut self) -> Result<(), HardwareError> {
        let _ = self.wifi.disconnect();
        self.wifi.connect().map_err(wifi_error)
    }

    fn reset_stack(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError> {
        warn!("wifi stack reset");
        let _ = self.wifi.disconnect();
        self.wifi.stop().map_err(wifi_error)?;
        self.access_point = None;
        self.scan_target = None;
        self.begin_station(credentials)
    }

    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), HardwareError> {
        self.access_point = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| HardwareError::Wifi("AP SSID too long".to_string()))?,
            password: password
                .try_into()
                .map_err(|_| HardwareError::Wifi("AP password too long".to_string()))?,
            auth_method: AuthMethod::WPA2Personal,
            channel: 1,
            ..Default::default()
        });
        self.apply()?;
        info!("access point started on `{ssid}`");
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), HardwareError> {
        self.access_point = None;
        self.apply()
    }

    fn start_scan(&mut self, ssid: &str) -> Result<(), HardwareError> {
        self.wifi
            .start_scan(&ScanConfig::default(), false)
            .map_err(wifi_error)?;
        self.scan_target = Some(ssid.to_string());
        Ok(())
    }

    fn poll_scan(&mut self) -> ScanStatus {
        if self.scan_target.is_none() {
            return ScanStatus::NotFound;
        }
        match self.wifi.is_scan_done() {
            Ok(false) => return ScanStatus::Running,
            Ok(true) => {}
            Err(err) => {
                warn!("wifi scan status failed: {err:?}");
                self.scan_target = None;
                return ScanStatus::Failed;
            }
        }

        let Some(target) = self.scan_target.take() else {
            return ScanStatus::NotFound;
        };
        match self.wifi.get_scan_result() {
            Ok(found) if found.iter().any(|ap| ap.ssid.as_str() == target) => ScanStatus::Found,
            Ok(_) => ScanStatus::NotFound,
            Err(err) => {
                warn!("wifi scan result failed: {err:?}");
                ScanStatus::Failed
            }
        }
    }
}

fn client_configuration(
    credentials: &StationCredentials,
) -> Result<ClientConfiguration, HardwareError> {
    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| HardwareError::Wifi("wifi ssid too long".to_string()))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| HardwareError::Wifi("wifi password too long".to_string()))?,
        auth_method,
        ..Default::default()
    })
}

fn wifi_error(err: esp_idf_svc::sys::EspError) -> HardwareError {
    HardwareError::Wifi(format!("{err:?}"))
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

impl ConfigStore for NvsStore {
    fn load(&mut self) -> Result<RuntimeConfig, HardwareError> {
        let mut runtime = self
            .load_runtime_config()
            .map_err(|err| HardwareError::Storage(format!("{err:#}")))?;
        ensure_wifi_defaults(&mut runtime.network);
        Ok(runtime)
    }

    fn save(&mut self, runtime: &RuntimeConfig) -> Result<(), HardwareError> {
        self.save_runtime_config(runtime)
            .map_err(|err| HardwareError::Storage(format!("{err:#}")))
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

/// Local time once SNTP has set the RTC, uptime until then.
#[derive(Default)]
struct DeviceClock {
    zone: Timezone,
}

impl Clock for DeviceClock {
    fn timestamp(&self) -> String {
        let now = Utc::now();
        if now.timestamp() < MIN_SYNCED_EPOCH_S {
            let uptime_s = monotonic_ms() / 1000;
            return format!(
                "{:02}:{:02}:{:02}",
                uptime_s / 3600,
                (uptime_s / 60) % 60,
                uptime_s % 60
            );
        }
        self.zone.local(now).format("%H:%M:%S").to_string()
    }

    fn set_timezone(&mut self, timezone: &str) -> Result<(), HardwareError> {
        self.zone =
            Timezone::parse(timezone).map_err(|err| HardwareError::Clock(err.to_string()))?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
