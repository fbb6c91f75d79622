use log::{info, warn};

use crate::{
    characteristics::DEVICE_NAME,
    command::{Command, ConfigUpdate},
    config::{NetworkConfig, RuntimeConfig},
    connectivity::{ConnectivityManager, ConnectivityState, NetAction},
    dew::{select_power, PowerRequest},
    hal::{
        Clock, ConfigStore, EnvironmentSensor, HeaterOutput, StationCredentials, WifiDriver,
        WirelessTransport,
    },
    logbuf::LogBuffer,
    staging::Inbox,
    table::BreakpointTable,
    types::{ConfigView, ControlState, DeviceInfo, Snapshot, StatusReport},
};

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Devices<'a> {
    pub sensor: &'a mut dyn EnvironmentSensor,
    pub heater: &'a mut dyn HeaterOutput,
    pub wifi: &'a mut dyn WifiDriver,
    pub transport: &'a mut dyn WirelessTransport,
    pub store: &'a mut dyn ConfigStore,
    pub clock: &'a mut dyn Clock,
}

/// Owns all mutable controller state; only [`DewController::step`] changes it.
#[derive(Debug)]
pub struct DewController {
    runtime: RuntimeConfig,
    table: BreakpointTable,
    control: ControlState,
    connectivity: ConnectivityManager,
    log: LogBuffer,

    started_ms: u64,
    last_sensor_ms: Option<u64>,
    last_notify_ms: Option<u64>,
    published_log: Option<u64>,
    sensor_faulted: bool,
}

impl DewController {
    pub fn new(mut runtime: RuntimeConfig) -> Self {
        runtime.sanitize();
        let table = BreakpointTable::from_record(&runtime.settings.table);
        let control = ControlState::new(runtime.settings.heater_enabled);
        let connectivity = ConnectivityManager::new(
            runtime.connectivity.clone(),
            station_credentials(&runtime.network),
        );
        let log = LogBuffer::new(runtime.controller.log_capacity_bytes);

        Self {
            runtime,
            table,
            control,
            connectivity,
            log,
            started_ms: 0,
            last_sensor_ms: None,
            last_notify_ms: None,
            published_log: None,
            sensor_faulted: false,
        }
    }

    pub fn load(store: &mut dyn ConfigStore) -> Self {
        let runtime = store.load().unwrap_or_else(|err| {
            warn!("failed to load settings, using defaults: {err}");
            RuntimeConfig::default()
        });
        Self::new(runtime)
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn table(&self) -> &BreakpointTable {
        &self.table
    }

    pub fn control(&self) -> &ControlState {
        &self.control
    }

    pub fn connectivity(&self) -> &ConnectivityState {
        self.connectivity.state()
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }

    pub fn idle_ms(&self) -> u64 {
        self.runtime.controller.loop_idle_ms
    }

    pub fn start(&mut self, now_ms: u64, devices: &mut Devices<'_>) -> Vec<NetAction> {
        self.started_ms = now_ms;
        if let Err(err) = devices.clock.set_timezone(&self.runtime.timezone) {
            warn!("stored timezone '{}' rejected: {err}", self.runtime.timezone);
        }
        self.record(
            devices,
            &format!("{DEVICE_NAME} {FIRMWARE_VERSION} starting, table has {} rows", self.table.len()),
        );

        if let Err(err) = devices.heater.set_power(self.control.last_power_percent) {
            warn!("{err}");
        }
        let actions = self.connectivity.start(now_ms, devices.wifi);
        self.publish_config(devices);
        self.publish_info(now_ms, devices);
        actions
    }

    /// One non-blocking loop iteration.
    pub fn step(&mut self, now_ms: u64, inbox: &Inbox, devices: &mut Devices<'_>) -> Vec<NetAction> {
        let mut actions = Vec::new();

        if let Some(payload) = inbox.config.drain() {
            actions.extend(self.handle_config(&payload, now_ms, devices));
        }
        if let Some(payload) = inbox.command.drain() {
            self.handle_command(&payload, devices);
        }
        if inbox.peers.take_restart_request() {
            match devices.transport.restart_advertising() {
                Ok(()) => self.record(devices, "last peer left, advertising restarted"),
                Err(err) => warn!("advertising restart failed: {err}"),
            }
        }

        let mode_before = self.connectivity.mode();
        actions.extend(self.connectivity.tick(now_ms, devices.wifi));
        let mode = self.connectivity.mode();
        if mode != mode_before {
            self.record(devices, &format!("wifi {}", mode.as_str()));
            self.publish_info(now_ms, devices);
        }

        if is_due(self.last_sensor_ms, now_ms, self.runtime.controller.sensor_poll_ms) {
            self.last_sensor_ms = Some(now_ms);
            self.poll_sensor(devices);
        }

        if is_due(self.last_notify_ms, now_ms, self.runtime.controller.notify_interval_ms) {
            self.last_notify_ms = Some(now_ms);
            if let Err(err) = devices.transport.notify(&self.control.status_payload()) {
                warn!("status notify failed: {err}");
            }
            self.publish_log(devices);
        }

        actions
    }

    pub fn snapshot(&self, now_ms: u64) -> Snapshot {
        Snapshot {
            status: self.status_report(now_ms),
            config: self.config_view(),
            info: self.device_info(now_ms),
            log: self.log.as_str().to_string(),
        }
    }

    pub fn status_report(&self, now_ms: u64) -> StatusReport {
        let connectivity = self.connectivity.state();
        StatusReport {
            status: self.control.status_payload(),
            wifi_mode: connectivity.mode,
            rssi: connectivity.signal_strength,
            manual_override: self.control.manual_override.is_some(),
            uptime_s: self.uptime_s(now_ms),
        }
    }

    pub fn config_view(&self) -> ConfigView {
        ConfigView {
            heater_enabled: self.runtime.settings.heater_enabled,
            count: self.table.len(),
            table: self.table.entries().to_vec(),
            wifi_ssid: self.runtime.network.wifi_ssid.clone(),
            wifi_password_set: !self.runtime.network.wifi_pass.is_empty(),
            timezone: self.runtime.timezone.clone(),
        }
    }

    pub fn device_info(&self, now_ms: u64) -> DeviceInfo {
        let connectivity = self.connectivity.state();
        DeviceInfo {
            name: DEVICE_NAME,
            fw: FIRMWARE_VERSION,
            wifi_mode: connectivity.mode,
            ssid: self.connectivity.network_name().to_string(),
            rssi: connectivity.signal_strength,
            ip: connectivity.ip,
            uptime_s: self.uptime_s(now_ms),
        }
    }

    fn handle_config(&mut self, payload: &str, now_ms: u64, devices: &mut Devices<'_>) -> Vec<NetAction> {
        let update = match ConfigUpdate::decode(payload) {
            Ok(update) => update,
            Err(err) => {
                warn!("dropping config write: {err}");
                self.record(devices, &format!("config rejected: {err}"));
                return Vec::new();
            }
        };

        let mut actions = Vec::new();

        if let Some(enabled) = update.heater_enabled {
            self.control.heater_enabled = enabled;
            self.runtime.settings.heater_enabled = enabled;
            self.record(devices, if enabled { "heater enabled" } else { "heater disabled" });
        }

        if let Some(rows) = update.table_rows() {
            self.table.replace(&rows);
            self.runtime.settings.table = self.table.to_record();
            self.record(
                devices,
                &format!("breakpoint table replaced, {} rows", self.table.len()),
            );
        }

        if let Some(timezone) = update.timezone.as_deref().map(str::trim) {
            match devices.clock.set_timezone(timezone) {
                Ok(()) => {
                    self.runtime.timezone = timezone.to_string();
                    self.record(devices, &format!("timezone {timezone}"));
                }
                Err(err) => {
                    warn!("timezone '{timezone}' rejected: {err}");
                    self.record(devices, &format!("timezone '{timezone}' rejected"));
                }
            }
        }

        if update.wifi_ssid.is_some() || update.wifi_password.is_some() {
            let network = &self.runtime.network;
            let ssid = update
                .wifi_ssid
                .as_deref()
                .map_or_else(|| network.wifi_ssid.clone(), |ssid| ssid.trim().to_string());
            let ssid_changed = ssid != network.wifi_ssid;
            // a blank password for the same network means "unchanged"
            let password = match update.wifi_password {
                Some(password) if !password.is_empty() => password,
                _ if !ssid_changed => network.wifi_pass.clone(),
                _ => String::new(),
            };

            if ssid_changed || password != network.wifi_pass {
                self.runtime.network.wifi_ssid = ssid;
                self.runtime.network.wifi_pass = password;
                let message = if self.runtime.network.has_credentials() {
                    format!("wifi credentials set for '{}'", self.runtime.network.wifi_ssid)
                } else {
                    "wifi credentials cleared".to_string()
                };
                self.record(devices, &message);
                actions.extend(self.connectivity.update_credentials(
                    station_credentials(&self.runtime.network),
                    now_ms,
                    devices.wifi,
                ));
            }
        }

        self.persist(devices);
        self.refresh_power(devices);
        self.publish_config(devices);
        actions
    }

    fn handle_command(&mut self, payload: &str, devices: &mut Devices<'_>) {
        match Command::parse(payload) {
            Ok(Command::ManualPower(percent)) => {
                self.control.manual_override = Some(percent);
                self.record(devices, &format!("manual power {percent}%"));
            }
            Ok(Command::Auto) => {
                self.control.manual_override = None;
                self.record(devices, "automatic control");
            }
            Ok(Command::ToggleHeater) => {
                let enabled = !self.control.heater_enabled;
                self.control.heater_enabled = enabled;
                self.runtime.settings.heater_enabled = enabled;
                self.record(devices, if enabled { "heater enabled" } else { "heater disabled" });
                self.persist(devices);
                self.publish_config(devices);
            }
            Err(err) => {
                warn!("dropping command: {err}");
                self.record(devices, &format!("command rejected: {err}"));
                return;
            }
        }
        self.refresh_power(devices);
    }

    fn poll_sensor(&mut self, devices: &mut Devices<'_>) {
        match devices.sensor.read_environment() {
            Ok(reading) => {
                if self.sensor_faulted {
                    self.sensor_faulted = false;
                    self.record(devices, "sensor recovered");
                }
                self.control.record_reading(reading);
                self.refresh_power(devices);
            }
            Err(err) => {
                warn!("{err}");
                if !self.sensor_faulted {
                    self.sensor_faulted = true;
                    let message = format!("{err}, holding {}%", self.control.last_power_percent);
                    self.record(devices, &message);
                }
            }
        }
    }

    fn refresh_power(&mut self, devices: &mut Devices<'_>) {
        let power = select_power(&PowerRequest {
            margin_c: self.control.last_margin_c,
            heater_enabled: self.control.heater_enabled,
            manual_override: self.control.manual_override,
            fallback_percent: self.runtime.controller.fallback_power_percent,
            table: &self.table,
        });

        let previous = self.control.last_power_percent;
        self.control.last_power_percent = power;
        if power != previous {
            self.record(devices, &format!("power {previous}% -> {power}%"));
        }
        if let Err(err) = devices.heater.set_power(power) {
            warn!("{err}");
        }
    }

    fn persist(&mut self, devices: &mut Devices<'_>) {
        if let Err(err) = devices.store.save(&self.runtime) {
            warn!("failed to persist settings: {err}");
            self.record(devices, "settings not saved, running from memory");
        }
    }

    fn publish_config(&self, devices: &mut Devices<'_>) {
        if let Err(err) = devices.transport.publish_config(&self.config_view()) {
            warn!("config publish failed: {err}");
        }
    }

    fn publish_info(&self, now_ms: u64, devices: &mut Devices<'_>) {
        if let Err(err) = devices.transport.publish_info(&self.device_info(now_ms)) {
            warn!("info publish failed: {err}");
        }
    }

    fn publish_log(&mut self, devices: &mut Devices<'_>) {
        let revision = self.log.revision();
        if self.published_log == Some(revision) {
            return;
        }
        match devices.transport.publish_log(self.log.as_str()) {
            Ok(()) => self.published_log = Some(revision),
            Err(err) => warn!("log publish failed: {err}"),
        }
    }

    fn record(&mut self, devices: &Devices<'_>, message: &str) {
        info!("{message}");
        self.log.push_line(&devices.clock.timestamp(), message);
    }

    fn uptime_s(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_ms) / 1_000
    }
}

fn station_credentials(network: &NetworkConfig) -> Option<StationCredentials> {
    network.has_credentials().then(|| StationCredentials {
        ssid: network.wifi_ssid.clone(),
        password: network.wifi_pass.clone(),
    })
}

fn is_due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms.map_or(true, |last| now_ms.saturating_sub(last) >= interval_ms)
}
