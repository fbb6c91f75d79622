//! Simulated hardware for the host build.

use core::net::Ipv4Addr;

use dew_common::{
    EnvironmentSensor, HardwareError, HeaterOutput, LinkStatus, Reading, ScanStatus,
    StationCredentials, WifiDriver,
};
use tracing::{debug, info};

use crate::host::monotonic_ms;

const ASSOCIATE_AFTER_MS: u64 = 2_000;
const SCAN_DURATION_MS: u64 = 1_500;
const FLAKY_PERIOD_MS: u64 = 90_000;
const FLAKY_OUTAGE_MS: u64 = 15_000;

/// Slow deterministic drift through damp night air.
#[derive(Debug, Default)]
pub struct SimSensor {
    tick: u32,
}

impl EnvironmentSensor for SimSensor {
    fn read_environment(&mut self) -> Result<Reading, HardwareError> {
        self.tick = self.tick.wrapping_add(1);
        let phase = self.tick as f32;
        Ok(Reading {
            temperature_c: 11.0 + 3.0 * (phase / 23.0).sin(),
            humidity: (82.0 + 14.0 * (phase / 17.0 + 1.0).sin()).min(100.0),
        })
    }
}

#[derive(Debug, Default)]
pub struct SimHeater {
    percent: u8,
}

impl HeaterOutput for SimHeater {
    fn set_power(&mut self, percent: u8) -> Result<(), HardwareError> {
        if percent != self.percent {
            info!("heater pwm {}% -> {percent}%", self.percent);
            self.percent = percent;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiProfile {
    Ok,
    Down,
    Flaky,
}

impl WifiProfile {
    pub fn from_env() -> Self {
        match std::env::var("DEW_SIM_WIFI").as_deref() {
            Ok("down") => Self::Down,
            Ok("flaky") => Self::Flaky,
            _ => Self::Ok,
        }
    }
}

/// Station/AP radio whose behaviour follows a [`WifiProfile`]. The flaky
/// profile also reproduces stacks that stay "associated" with an RSSI of 0
/// after the link is gone.
#[derive(Debug)]
pub struct SimWifi {
    profile: WifiProfile,
    ssid: Option<String>,
    station_since_ms: Option<u64>,
    ap_up: bool,
    scan_started_ms: Option<u64>,
}

impl SimWifi {
    pub fn new(profile: WifiProfile) -> Self {
        Self {
            profile,
            ssid: None,
            station_since_ms: None,
            ap_up: false,
            scan_started_ms: None,
        }
    }
}

impl WifiDriver for SimWifi {
    fn begin_station(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError> {
        debug!("sim wifi: associating with '{}'", credentials.ssid);
        self.ssid = Some(credentials.ssid.clone());
        self.station_since_ms = Some(monotonic_ms());
        Ok(())
    }

    fn link(&mut self) -> LinkStatus {
        let now_ms = monotonic_ms();
        let Some(since) = self.station_since_ms else {
            return LinkStatus::default();
        };
        if self.profile == WifiProfile::Down || now_ms.saturating_sub(since) < ASSOCIATE_AFTER_MS {
            return LinkStatus::default();
        }
        if self.profile == WifiProfile::Flaky
            && now_ms % FLAKY_PERIOD_MS >= FLAKY_PERIOD_MS - FLAKY_OUTAGE_MS
        {
            return LinkStatus {
                associated: true,
                rssi: Some(0),
                ip: None,
            };
        }

        LinkStatus {
            associated: true,
            rssi: Some(-48 - ((now_ms / 1_000) % 10) as i8),
            ip: Some(Ipv4Addr::new(192, 168, 1, 87)),
        }
    }

    fn reconnect(&mut self) -> Result<(), HardwareError> {
        if self.ssid.is_none() {
            return Err(HardwareError::Wifi("no station configured".to_string()));
        }
        self.station_since_ms = Some(monotonic_ms());
        Ok(())
    }

    fn reset_stack(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError> {
        info!("sim wifi: stack reset");
        self.ap_up = false;
        self.scan_started_ms = None;
        self.begin_station(credentials)
    }

    fn start_access_point(&mut self, ssid: &str, _password: &str) -> Result<(), HardwareError> {
        info!("sim wifi: access point '{ssid}' on 192.168.4.1");
        self.ap_up = true;
        Ok(())
    }

    fn stop_access_point(&mut self) -> Result<(), HardwareError> {
        self.ap_up = false;
        Ok(())
    }

    fn start_scan(&mut self, ssid: &str) -> Result<(), HardwareError> {
        if !self.ap_up {
            return Err(HardwareError::Wifi("scan requires the access point radio".to_string()));
        }
        debug!("sim wifi: scanning for '{ssid}'");
        self.scan_started_ms = Some(monotonic_ms());
        Ok(())
    }

    fn poll_scan(&mut self) -> ScanStatus {
        let Some(started) = self.scan_started_ms else {
            return ScanStatus::NotFound;
        };
        if monotonic_ms().saturating_sub(started) < SCAN_DURATION_MS {
            return ScanStatus::Running;
        }
        self.scan_started_ms = None;
        match self.profile {
            WifiProfile::Down => ScanStatus::NotFound,
            WifiProfile::Ok | WifiProfile::Flaky => ScanStatus::Found,
        }
    }
}
