use serde::{Deserialize, Serialize};

use crate::{
    dew::DEFAULT_FALLBACK_POWER_PERCENT,
    table::{BreakpointTable, TableRecord},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub sensor_poll_ms: u64,
    pub notify_interval_ms: u64,
    pub loop_idle_ms: u64,
    /// Power applied while the margin is unknown (sensor fault).
    pub fallback_power_percent: u8,
    pub log_capacity_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sensor_poll_ms: 5_000,
            notify_interval_ms: 1_000,
            loop_idle_ms: 20,
            fallback_power_percent: DEFAULT_FALLBACK_POWER_PERCENT,
            log_capacity_bytes: 2_048,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.sensor_poll_ms = self.sensor_poll_ms.clamp(2_000, 600_000);
        self.notify_interval_ms = self.notify_interval_ms.clamp(100, 60_000);
        self.loop_idle_ms = self.loop_idle_ms.clamp(1, 1_000);
        self.fallback_power_percent = self.fallback_power_percent.min(100);
        self.log_capacity_bytes = self.log_capacity_bytes.clamp(256, 16_384);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub connect_wait_ms: u64,
    pub connect_grace_ms: u64,
    pub retry_interval_ms: u64,
    pub hard_reset_after_ms: u64,
    pub ap_rescan_interval_ms: u64,
    pub scan_timeout_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub min_valid_rssi: i8,
    pub max_valid_rssi: i8,
    pub ap_ssid: String,
    pub ap_password: String,
    pub hostname: String,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            connect_wait_ms: 15_000,
            connect_grace_ms: 5_000,
            retry_interval_ms: 10_000,
            hard_reset_after_ms: 120_000,
            ap_rescan_interval_ms: 60_000,
            scan_timeout_ms: 10_000,
            housekeeping_interval_ms: 1_000,
            min_valid_rssi: -100,
            max_valid_rssi: -1,
            ap_ssid: "Q150DewController-AP".to_string(),
            ap_password: "dewcontrol".to_string(),
            hostname: "q150dew".to_string(),
        }
    }
}

impl ConnectivityConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.connect_wait_ms = self.connect_wait_ms.max(1_000);
        self.retry_interval_ms = self.retry_interval_ms.max(1_000);
        self.hard_reset_after_ms = self.hard_reset_after_ms.max(self.retry_interval_ms);
        self.ap_rescan_interval_ms = self.ap_rescan_interval_ms.max(5_000);
        self.scan_timeout_ms = self.scan_timeout_ms.clamp(1_000, self.ap_rescan_interval_ms);
        self.housekeeping_interval_ms = self.housekeeping_interval_ms.clamp(50, 10_000);

        if self.min_valid_rssi > self.max_valid_rssi {
            self.min_valid_rssi = defaults.min_valid_rssi;
            self.max_valid_rssi = defaults.max_valid_rssi;
        }
        if self.ap_ssid.trim().is_empty() {
            self.ap_ssid = defaults.ap_ssid;
        }
        // WPA2 needs 8..=63 characters
        if !(8..=63).contains(&self.ap_password.len()) {
            self.ap_password = defaults.ap_password;
        }
        if self.hostname.trim().is_empty() {
            self.hostname = defaults.hostname;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub heater_enabled: bool,
    pub table: TableRecord,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            heater_enabled: true,
            table: TableRecord::default(),
        }
    }
}

impl PersistedSettings {
    pub fn sanitize(&mut self) {
        self.table = BreakpointTable::from_record(&self.table).to_record();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
        }
    }
}

impl NetworkConfig {
    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub settings: PersistedSettings,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            connectivity: ConnectivityConfig::default(),
            settings: PersistedSettings::default(),
            network: NetworkConfig::default(),
            timezone: default_timezone(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.connectivity.sanitize();
        self.settings.sanitize();
        self.network.wifi_ssid = self.network.wifi_ssid.trim().to_string();
        if self.timezone.trim().is_empty() {
            self.timezone = default_timezone();
        }
    }
}

fn default_timezone() -> String {
    "UTC0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Breakpoint, MAX_BREAKPOINTS};
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let runtime: RuntimeConfig = serde_json::from_str(
            r#"{"settings":{"heater_enabled":false,"table":{"count":1,"entries":[{"spread":2.0,"power":70}]}}}"#,
        )
        .unwrap();

        assert!(!runtime.settings.heater_enabled);
        assert_eq!(runtime.controller, ControllerConfig::default());
        assert_eq!(runtime.network, NetworkConfig::default());
        assert_eq!(runtime.timezone, "UTC0");
    }

    #[test]
    fn sanitize_repairs_stored_table() {
        let mut settings = PersistedSettings {
            heater_enabled: true,
            table: TableRecord {
                count: 99,
                entries: vec![
                    Breakpoint::new(1.0, 90),
                    Breakpoint::new(3.0, 30),
                    Breakpoint {
                        threshold: 2.0,
                        power: 180,
                    },
                ],
            },
        };
        settings.sanitize();

        assert_eq!(settings.table.count, 3);
        assert_eq!(
            settings.table.entries,
            vec![
                Breakpoint::new(3.0, 30),
                Breakpoint::new(2.0, 100),
                Breakpoint::new(1.0, 90),
            ]
        );
    }

    #[test]
    fn default_settings_hold_full_table() {
        let settings = PersistedSettings::default();
        assert!(settings.heater_enabled);
        assert_eq!(settings.table.count, MAX_BREAKPOINTS as i64);
    }

    #[test]
    fn connectivity_sanitize_restores_unusable_values() {
        let mut config = ConnectivityConfig {
            retry_interval_ms: 30_000,
            hard_reset_after_ms: 5_000,
            min_valid_rssi: 0,
            max_valid_rssi: -50,
            ap_password: "short".to_string(),
            hostname: "  ".to_string(),
            ..ConnectivityConfig::default()
        };
        config.sanitize();

        assert_eq!(config.hard_reset_after_ms, 30_000);
        assert_eq!((config.min_valid_rssi, config.max_valid_rssi), (-100, -1));
        assert_eq!(config.ap_password, "dewcontrol");
        assert_eq!(config.hostname, "q150dew");
    }

    #[test]
    fn controller_sanitize_clamps_cadences() {
        let mut config = ControllerConfig {
            sensor_poll_ms: 10,
            notify_interval_ms: 0,
            loop_idle_ms: 0,
            fallback_power_percent: 255,
            log_capacity_bytes: 1,
        };
        config.sanitize();

        assert_eq!(config.sensor_poll_ms, 2_000);
        assert_eq!(config.notify_interval_ms, 100);
        assert_eq!(config.loop_idle_ms, 1);
        assert_eq!(config.fallback_power_percent, 100);
        assert_eq!(config.log_capacity_bytes, 256);
    }

    #[test]
    fn credentials_require_a_non_blank_ssid() {
        let mut network = NetworkConfig::default();
        assert!(!network.has_credentials());
        network.wifi_ssid = "   ".to_string();
        assert!(!network.has_credentials());
        network.wifi_ssid = "observatory".to_string();
        assert!(network.has_credentials());
    }
}
