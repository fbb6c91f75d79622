use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::{
    dew::{dew_point_c, margin_c},
    table::Breakpoint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSource {
    Auto,
    Manual,
}

impl ControlSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityMode {
    StationConnecting,
    StationConnected,
    StationDisconnected,
    AccessPoint,
}

impl ConnectivityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StationConnecting => "STATION_CONNECTING",
            Self::StationConnected => "STATION_CONNECTED",
            Self::StationDisconnected => "STATION_DISCONNECTED",
            Self::AccessPoint => "ACCESS_POINT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub last_temperature_c: Option<f32>,
    pub last_humidity: Option<f32>,
    pub last_dew_point_c: Option<f32>,
    pub last_margin_c: Option<f32>,
    pub last_power_percent: u8,
    pub heater_enabled: bool,
    pub manual_override: Option<u8>,
}

impl ControlState {
    pub fn new(heater_enabled: bool) -> Self {
        Self {
            last_temperature_c: None,
            last_humidity: None,
            last_dew_point_c: None,
            last_margin_c: None,
            last_power_percent: 0,
            heater_enabled,
            manual_override: None,
        }
    }

    pub fn record_reading(&mut self, reading: Reading) {
        let t = Some(reading.temperature_c).filter(|value| value.is_finite());
        let rh = Some(reading.humidity).filter(|value| value.is_finite());
        let td = dew_point_c(t, rh);

        self.last_temperature_c = t;
        self.last_humidity = rh;
        self.last_dew_point_c = td;
        self.last_margin_c = margin_c(t, td);
    }

    pub fn source(&self) -> ControlSource {
        if self.manual_override.is_some() {
            ControlSource::Manual
        } else {
            ControlSource::Auto
        }
    }

    pub fn status_payload(&self) -> StatusPayload {
        StatusPayload {
            temperature_c: round_centi(self.last_temperature_c),
            humidity: round_centi(self.last_humidity),
            dew_point_c: round_centi(self.last_dew_point_c),
            spread: round_centi(self.last_margin_c),
            power: self.last_power_percent,
            enabled: self.heater_enabled,
            source: self.source(),
        }
    }
}

/// Status characteristic body. Field names are fixed by deployed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    #[serde(rename = "T")]
    pub temperature_c: Option<f32>,
    #[serde(rename = "RH")]
    pub humidity: Option<f32>,
    #[serde(rename = "Td")]
    pub dew_point_c: Option<f32>,
    pub spread: Option<f32>,
    pub power: u8,
    pub enabled: bool,
    pub source: ControlSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigView {
    #[serde(rename = "heaterEnabled")]
    pub heater_enabled: bool,
    pub count: usize,
    pub table: Vec<Breakpoint>,
    #[serde(rename = "wifiSSID")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPasswordSet")]
    pub wifi_password_set: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: &'static str,
    pub fw: &'static str,
    #[serde(rename = "wifiMode")]
    pub wifi_mode: ConnectivityMode,
    pub ssid: String,
    pub rssi: Option<i8>,
    pub ip: Option<Ipv4Addr>,
    #[serde(rename = "uptimeS")]
    pub uptime_s: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub status: StatusPayload,
    #[serde(rename = "wifiMode")]
    pub wifi_mode: ConnectivityMode,
    pub rssi: Option<i8>,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
    #[serde(rename = "uptimeS")]
    pub uptime_s: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub status: StatusReport,
    pub config: ConfigView,
    pub info: DeviceInfo,
    pub log: String,
}

fn round_centi(value: Option<f32>) -> Option<f32> {
    value.map(|value| (value * 100.0).round() / 100.0)
}
