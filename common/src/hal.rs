use core::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    config::RuntimeConfig,
    error::HardwareError,
    types::{ConfigView, DeviceInfo, Reading, StatusPayload},
};

pub trait EnvironmentSensor {
    fn read_environment(&mut self) -> Result<Reading, HardwareError>;
}

pub trait HeaterOutput {
    /// `percent` is always within 0..=100.
    fn set_power(&mut self, percent: u8) -> Result<(), HardwareError>;
}

pub trait ConfigStore {
    fn load(&mut self) -> Result<RuntimeConfig, HardwareError>;
    fn save(&mut self, runtime: &RuntimeConfig) -> Result<(), HardwareError>;
}

/// Outbound half of the characteristic protocol. Inbound writes go straight
/// into the [`Inbox`](crate::staging::Inbox).
pub trait WirelessTransport {
    fn notify(&mut self, status: &StatusPayload) -> Result<(), HardwareError>;
    fn publish_config(&mut self, config: &ConfigView) -> Result<(), HardwareError>;
    fn publish_info(&mut self, info: &DeviceInfo) -> Result<(), HardwareError>;
    fn publish_log(&mut self, log: &str) -> Result<(), HardwareError>;
    fn restart_advertising(&mut self) -> Result<(), HardwareError>;
}

pub trait Clock {
    /// Wall-clock `HH:MM:SS` once time is known, uptime otherwise.
    fn timestamp(&self) -> String;
    /// Accepts IANA names and POSIX TZ rules; on error the previous zone stays.
    fn set_timezone(&mut self, timezone: &str) -> Result<(), HardwareError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub associated: bool,
    pub rssi: Option<i8>,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Running,
    Found,
    NotFound,
    Failed,
}

/// Every call returns immediately.
pub trait WifiDriver {
    fn begin_station(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError>;
    fn link(&mut self) -> LinkStatus;
    fn reconnect(&mut self) -> Result<(), HardwareError>;
    /// Stops and restarts the whole stack, then begins association again.
    fn reset_stack(&mut self, credentials: &StationCredentials) -> Result<(), HardwareError>;
    fn start_access_point(&mut self, ssid: &str, password: &str) -> Result<(), HardwareError>;
    fn stop_access_point(&mut self) -> Result<(), HardwareError>;
    fn start_scan(&mut self, ssid: &str) -> Result<(), HardwareError>;
    fn poll_scan(&mut self) -> ScanStatus;
}

#[derive(Debug, Default)]
pub struct PeerTracker {
    connected: AtomicUsize,
    restart_requested: AtomicBool,
}

impl PeerTracker {
    pub const fn new() -> Self {
        Self {
            connected: AtomicUsize::new(0),
            restart_requested: AtomicBool::new(false),
        }
    }

    pub fn peer_connected(&self) {
        self.connected.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when this was the last connected peer.
    pub fn peer_disconnected(&self) -> bool {
        let previous = self
            .connected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        let dropped_to_zero = previous <= 1;
        if dropped_to_zero {
            self.restart_requested.store(true, Ordering::Release);
        }
        dropped_to_zero
    }

    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::Acquire)
    }

    pub fn take_restart_request(&self) -> bool {
        self.restart_requested.swap(false, Ordering::AcqRel)
    }
}
