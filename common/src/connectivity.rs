use core::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::{
    config::ConnectivityConfig,
    hal::{LinkStatus, ScanStatus, StationCredentials, WifiDriver},
    types::ConnectivityMode,
};

/// Work for the firmware after a link change. All of these are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetAction {
    BindHttp,
    AnnounceHostname,
    SyncTime,
}

const ON_CONNECTED: [NetAction; 3] = [
    NetAction::BindHttp,
    NetAction::AnnounceHostname,
    NetAction::SyncTime,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityState {
    pub mode: ConnectivityMode,
    pub last_transition_ms: u64,
    pub failure_window_start_ms: Option<u64>,
    pub signal_strength: Option<i8>,
    pub ip: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub struct ConnectivityManager {
    config: ConnectivityConfig,
    credentials: Option<StationCredentials>,
    state: ConnectivityState,

    attempt_started_ms: u64,
    grace_announced: bool,
    last_housekeeping_ms: Option<u64>,
    last_retry_ms: u64,

    ap_active: bool,
    last_rescan_ms: u64,
    scan_started_ms: Option<u64>,
}

impl ConnectivityManager {
    pub fn new(config: ConnectivityConfig, credentials: Option<StationCredentials>) -> Self {
        let mode = if credentials.is_some() {
            ConnectivityMode::StationConnecting
        } else {
            ConnectivityMode::AccessPoint
        };
        Self {
            config,
            credentials,
            state: ConnectivityState {
                mode,
                last_transition_ms: 0,
                failure_window_start_ms: None,
                signal_strength: None,
                ip: None,
            },
            attempt_started_ms: 0,
            grace_announced: false,
            last_housekeeping_ms: None,
            last_retry_ms: 0,
            ap_active: false,
            last_rescan_ms: 0,
            scan_started_ms: None,
        }
    }

    pub fn state(&self) -> &ConnectivityState {
        &self.state
    }

    pub fn mode(&self) -> ConnectivityMode {
        self.state.mode
    }

    pub fn credentials(&self) -> Option<&StationCredentials> {
        self.credentials.as_ref()
    }

    pub fn network_name(&self) -> &str {
        match (self.state.mode, &self.credentials) {
            (ConnectivityMode::AccessPoint, _) | (_, None) => &self.config.ap_ssid,
            (_, Some(credentials)) => &credentials.ssid,
        }
    }

    pub fn start(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        match self.credentials.clone() {
            Some(credentials) => {
                self.begin_connecting(now_ms, driver, &credentials);
                Vec::new()
            }
            None => {
                info!("no station credentials configured, starting access point");
                self.enter_access_point(now_ms, driver)
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        if let Some(last) = self.last_housekeeping_ms {
            if now_ms.saturating_sub(last) < self.config.housekeeping_interval_ms {
                return Vec::new();
            }
        }
        self.last_housekeeping_ms = Some(now_ms);

        match self.state.mode {
            ConnectivityMode::StationConnecting => self.tick_connecting(now_ms, driver),
            ConnectivityMode::StationConnected => self.tick_connected(now_ms, driver),
            ConnectivityMode::StationDisconnected => self.tick_disconnected(now_ms, driver),
            ConnectivityMode::AccessPoint => self.tick_access_point(now_ms, driver),
        }
    }

    pub fn update_credentials(
        &mut self,
        credentials: Option<StationCredentials>,
        now_ms: u64,
        driver: &mut dyn WifiDriver,
    ) -> Vec<NetAction> {
        if self.credentials == credentials {
            return Vec::new();
        }
        self.credentials = credentials.clone();

        match credentials {
            Some(credentials) => {
                info!("station credentials updated, joining '{}'", credentials.ssid);
                self.shutdown_access_point(driver);
                self.scan_started_ms = None;
                self.begin_connecting(now_ms, driver, &credentials);
                Vec::new()
            }
            None if self.state.mode == ConnectivityMode::AccessPoint => Vec::new(),
            None => {
                info!("station credentials cleared, starting access point");
                self.enter_access_point(now_ms, driver)
            }
        }
    }

    fn tick_connecting(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        let link = driver.link();
        if self.link_is_up(&link) {
            return self.enter_connected(now_ms, link);
        }

        let elapsed = now_ms.saturating_sub(self.attempt_started_ms);
        if elapsed >= self.config.connect_wait_ms + self.config.connect_grace_ms {
            warn!("station association failed after {elapsed} ms, falling back to access point");
            return self.enter_access_point(now_ms, driver);
        }
        if elapsed >= self.config.connect_wait_ms && !self.grace_announced {
            self.grace_announced = true;
            info!(
                "still associating, allowing {} ms more",
                self.config.connect_grace_ms
            );
        }
        Vec::new()
    }

    fn tick_connected(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        let link = driver.link();
        if self.link_is_up(&link) {
            self.state.signal_strength = link.rssi;
            self.state.ip = link.ip;
            return Vec::new();
        }

        if link.associated {
            warn!(
                "station reports associated with implausible rssi {:?}, treating link as lost",
                link.rssi
            );
        } else {
            warn!("station association lost");
        }
        self.transition(ConnectivityMode::StationDisconnected, now_ms);
        self.state.failure_window_start_ms = Some(now_ms);
        self.last_retry_ms = now_ms;
        if let Err(err) = driver.reconnect() {
            warn!("reconnect request failed: {err}");
        }
        Vec::new()
    }

    fn tick_disconnected(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        let link = driver.link();
        if self.link_is_up(&link) {
            info!("station re-associated");
            return self.enter_connected(now_ms, link);
        }
        if now_ms.saturating_sub(self.last_retry_ms) < self.config.retry_interval_ms {
            return Vec::new();
        }
        self.last_retry_ms = now_ms;

        let Some(credentials) = self.credentials.clone() else {
            return self.enter_access_point(now_ms, driver);
        };
        let window_start = *self.state.failure_window_start_ms.get_or_insert(now_ms);
        let outage_ms = now_ms.saturating_sub(window_start);

        if outage_ms >= self.config.hard_reset_after_ms {
            warn!("outage of {outage_ms} ms, resetting wifi stack");
            if let Err(err) = driver.reset_stack(&credentials) {
                warn!("wifi stack reset failed: {err}");
            }
            self.state.failure_window_start_ms = Some(now_ms);
        } else {
            debug!("retrying association ({outage_ms} ms into outage)");
            if let Err(err) = driver.reconnect() {
                warn!("reconnect request failed: {err}");
            }
        }
        Vec::new()
    }

    fn tick_access_point(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        let actions = self.ensure_access_point(driver);
        let Some(credentials) = self.credentials.clone() else {
            return actions;
        };

        if let Some(started) = self.scan_started_ms {
            match driver.poll_scan() {
                ScanStatus::Running => {
                    if now_ms.saturating_sub(started) >= self.config.scan_timeout_ms {
                        warn!("scan for '{}' timed out", credentials.ssid);
                        self.scan_started_ms = None;
                    }
                }
                ScanStatus::Found => {
                    info!("'{}' is visible, leaving access point", credentials.ssid);
                    self.scan_started_ms = None;
                    self.shutdown_access_point(driver);
                    self.begin_connecting(now_ms, driver, &credentials);
                }
                ScanStatus::NotFound => {
                    debug!("'{}' not in range", credentials.ssid);
                    self.scan_started_ms = None;
                }
                ScanStatus::Failed => {
                    warn!("scan for '{}' failed", credentials.ssid);
                    self.scan_started_ms = None;
                }
            }
            return actions;
        }

        if now_ms.saturating_sub(self.last_rescan_ms) >= self.config.ap_rescan_interval_ms {
            self.last_rescan_ms = now_ms;
            match driver.start_scan(&credentials.ssid) {
                Ok(()) => self.scan_started_ms = Some(now_ms),
                Err(err) => warn!("could not start scan: {err}"),
            }
        }
        actions
    }

    fn begin_connecting(
        &mut self,
        now_ms: u64,
        driver: &mut dyn WifiDriver,
        credentials: &StationCredentials,
    ) {
        if let Err(err) = driver.begin_station(credentials) {
            warn!("could not start association with '{}': {err}", credentials.ssid);
        }
        self.transition(ConnectivityMode::StationConnecting, now_ms);
        self.attempt_started_ms = now_ms;
        self.grace_announced = false;
        self.state.failure_window_start_ms = None;
        self.state.signal_strength = None;
        self.state.ip = None;
    }

    fn enter_connected(&mut self, now_ms: u64, link: LinkStatus) -> Vec<NetAction> {
        self.transition(ConnectivityMode::StationConnected, now_ms);
        self.state.failure_window_start_ms = None;
        self.state.signal_strength = link.rssi;
        self.state.ip = link.ip;
        ON_CONNECTED.to_vec()
    }

    fn enter_access_point(&mut self, now_ms: u64, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        self.transition(ConnectivityMode::AccessPoint, now_ms);
        self.state.failure_window_start_ms = None;
        self.state.signal_strength = None;
        self.state.ip = None;
        self.scan_started_ms = None;
        self.last_rescan_ms = now_ms;
        self.ap_active = false;
        self.ensure_access_point(driver)
    }

    fn ensure_access_point(&mut self, driver: &mut dyn WifiDriver) -> Vec<NetAction> {
        if self.ap_active {
            return Vec::new();
        }
        match driver.start_access_point(&self.config.ap_ssid, &self.config.ap_password) {
            Ok(()) => {
                info!("access point '{}' up", self.config.ap_ssid);
                self.ap_active = true;
                vec![NetAction::BindHttp]
            }
            Err(err) => {
                warn!("access point start failed: {err}");
                Vec::new()
            }
        }
    }

    fn shutdown_access_point(&mut self, driver: &mut dyn WifiDriver) {
        if !self.ap_active {
            return;
        }
        if let Err(err) = driver.stop_access_point() {
            warn!("access point stop failed: {err}");
        }
        self.ap_active = false;
    }

    // some stacks report associated with RSSI 0 after the AP is gone
    fn link_is_up(&self, link: &LinkStatus) -> bool {
        link.associated
            && link.rssi.is_some_and(|rssi| {
                (self.config.min_valid_rssi..=self.config.max_valid_rssi).contains(&rssi)
            })
    }

    fn transition(&mut self, mode: ConnectivityMode, now_ms: u64) {
        if self.state.mode != mode {
            info!("wifi {} -> {}", self.state.mode.as_str(), mode.as_str());
        }
        self.state.mode = mode;
        self.state.last_transition_ms = now_ms;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::HardwareError;
    use pretty_assertions::assert_eq;

    #[derive(Debug)]
    pub(crate) struct FakeWifi {
        pub link: LinkStatus,
        pub scan: ScanStatus,
        pub begin_calls: usize,
        pub reconnect_calls: usize,
        pub reset_calls: usize,
        pub ap_starts: usize,
        pub ap_stops: usize,
        pub scans_started: usize,
    }

    impl FakeWifi {
        pub fn down() -> Self {
            Self {
                link: LinkStatus::default(),
                scan: ScanStatus::Running,
                begin_calls: 0,
                reconnect_calls: 0,
                reset_calls: 0,
                ap_starts: 0,
                ap_stops: 0,
                scans_started: 0,
            }
        }

        pub fn up() -> Self {
            let mut wifi = Self::down();
            wifi.set_up();
            wifi
        }

        pub fn set_up(&mut self) {
            self.link = LinkStatus {
                associated: true,
                rssi: Some(-58),
                ip: Some(Ipv4Addr::new(192, 168, 1, 50)),
            };
        }
    }

    impl WifiDriver for FakeWifi {
        fn begin_station(&mut self, _credentials: &StationCredentials) -> Result<(), HardwareError> {
            self.begin_calls += 1;
            Ok(())
        }

        fn link(&mut self) -> LinkStatus {
            self.link
        }

        fn reconnect(&mut self) -> Result<(), HardwareError> {
            self.reconnect_calls += 1;
            Ok(())
        }

        fn reset_stack(&mut self, _credentials: &StationCredentials) -> Result<(), HardwareError> {
            self.reset_calls += 1;
            Ok(())
        }

        fn start_access_point(&mut self, _ssid: &str, _password: &str) -> Result<(), HardwareError> {
            self.ap_starts += 1;
            Ok(())
        }

        fn stop_access_point(&mut self) -> Result<(), HardwareError> {
            self.ap_stops += 1;
            Ok(())
        }

        fn start_scan(&mut self, _ssid: &str) -> Result<(), HardwareError> {
            self.scans_started += 1;
            Ok(())
        }

        fn poll_scan(&mut self) -> ScanStatus {
            self.scan
        }
    }

    pub(crate) fn credentials() -> StationCredentials {
        StationCredentials {
            ssid: "observatory".to_string(),
            password: "hunter22".to_string(),
        }
    }

    fn run(
        manager: &mut ConnectivityManager,
        wifi: &mut FakeWifi,
        from_ms: u64,
        to_ms: u64,
    ) -> Vec<NetAction> {
        let mut actions = Vec::new();
        let mut now = from_ms;
        while now <= to_ms {
            actions.extend(manager.tick(now, wifi));
            now += 1_000;
        }
        actions
    }

    #[test]
    fn no_credentials_goes_straight_to_access_point() {
        let mut wifi = FakeWifi::down();
        let mut manager = ConnectivityManager::new(ConnectivityConfig::default(), None);

        let actions = manager.start(0, &mut wifi);
        assert_eq!(actions, vec![NetAction::BindHttp]);
        assert_eq!(manager.mode(), ConnectivityMode::AccessPoint);

        run(&mut manager, &mut wifi, 0, 300_000);
        assert_eq!(manager.mode(), ConnectivityMode::AccessPoint);
        assert_eq!(wifi.begin_calls, 0);
        assert_eq!(wifi.scans_started, 0);
        assert_eq!(wifi.ap_starts, 1);
    }

    #[test]
    fn failing_association_falls_back_only_after_window() {
        let mut wifi = FakeWifi::down();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));

        assert!(manager.start(0, &mut wifi).is_empty());
        assert_eq!(wifi.begin_calls, 1);

        run(&mut manager, &mut wifi, 0, 19_000);
        assert_eq!(manager.mode(), ConnectivityMode::StationConnecting);
        assert_eq!(wifi.ap_starts, 0);

        let actions = manager.tick(20_000, &mut wifi);
        assert_eq!(manager.mode(), ConnectivityMode::AccessPoint);
        assert_eq!(actions, vec![NetAction::BindHttp]);
        assert_eq!(wifi.ap_starts, 1);
    }

    #[test]
    fn association_triggers_post_connect_work() {
        let mut wifi = FakeWifi::up();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
        manager.start(0, &mut wifi);

        let actions = manager.tick(0, &mut wifi);
        assert_eq!(actions, ON_CONNECTED.to_vec());
        assert_eq!(manager.mode(), ConnectivityMode::StationConnected);
        assert_eq!(manager.state().signal_strength, Some(-58));
        assert_eq!(manager.network_name(), "observatory");

        // steady state emits nothing further
        assert!(run(&mut manager, &mut wifi, 1_000, 30_000).is_empty());
    }

    #[test]
    fn implausible_rssi_counts_as_lost_link() {
        for rssi in [Some(0), Some(10), None, Some(-120)] {
            let mut wifi = FakeWifi::up();
            let mut manager =
                ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
            manager.start(0, &mut wifi);
            manager.tick(0, &mut wifi);

            wifi.link.rssi = rssi;
            manager.tick(1_000, &mut wifi);

            assert_eq!(
                manager.mode(),
                ConnectivityMode::StationDisconnected,
                "rssi {rssi:?}"
            );
            assert_eq!(manager.state().failure_window_start_ms, Some(1_000));
            assert_eq!(wifi.reconnect_calls, 1);
        }
    }

    #[test]
    fn prolonged_outage_escalates_to_stack_reset() {
        let mut wifi = FakeWifi::up();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
        manager.start(0, &mut wifi);
        manager.tick(0, &mut wifi);

        wifi.link = LinkStatus::default();
        run(&mut manager, &mut wifi, 1_000, 120_000);
        assert_eq!(manager.mode(), ConnectivityMode::StationDisconnected);
        assert_eq!(wifi.reset_calls, 0);
        // loss at 1 s, then retries every 10 s through 111 s
        assert_eq!(wifi.reconnect_calls, 12);

        manager.tick(121_000, &mut wifi);
        assert_eq!(wifi.reset_calls, 1);
        assert_eq!(manager.state().failure_window_start_ms, Some(121_000));

        wifi.set_up();
        let actions = manager.tick(122_000, &mut wifi);
        assert_eq!(actions, ON_CONNECTED.to_vec());
        assert_eq!(manager.state().failure_window_start_ms, None);
    }

    #[test]
    fn access_point_rescans_and_rejoins() {
        let mut wifi = FakeWifi::down();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
        manager.start(0, &mut wifi);
        run(&mut manager, &mut wifi, 0, 20_000);
        assert_eq!(manager.mode(), ConnectivityMode::AccessPoint);

        run(&mut manager, &mut wifi, 21_000, 79_000);
        assert_eq!(wifi.scans_started, 0);

        manager.tick(80_000, &mut wifi);
        assert_eq!(wifi.scans_started, 1);

        wifi.scan = ScanStatus::Found;
        manager.tick(81_000, &mut wifi);
        assert_eq!(manager.mode(), ConnectivityMode::StationConnecting);
        assert_eq!(wifi.ap_stops, 1);
        assert_eq!(wifi.begin_calls, 2);
    }

    #[test]
    fn stalled_scan_times_out_and_retries_next_interval() {
        let mut wifi = FakeWifi::down();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
        manager.start(0, &mut wifi);
        run(&mut manager, &mut wifi, 0, 20_000);

        run(&mut manager, &mut wifi, 21_000, 139_000);
        assert_eq!(wifi.scans_started, 1);
        assert_eq!(manager.mode(), ConnectivityMode::AccessPoint);

        manager.tick(140_000, &mut wifi);
        assert_eq!(wifi.scans_started, 2);
    }

    #[test]
    fn new_credentials_leave_access_point() {
        let mut wifi = FakeWifi::down();
        let mut manager = ConnectivityManager::new(ConnectivityConfig::default(), None);
        manager.start(0, &mut wifi);

        let actions = manager.update_credentials(Some(credentials()), 5_000, &mut wifi);
        assert!(actions.is_empty());
        assert_eq!(manager.mode(), ConnectivityMode::StationConnecting);
        assert_eq!(wifi.ap_stops, 1);
        assert_eq!(wifi.begin_calls, 1);

        // unchanged credentials are a no-op
        manager.update_credentials(Some(credentials()), 6_000, &mut wifi);
        assert_eq!(wifi.begin_calls, 1);
    }

    #[test]
    fn housekeeping_is_rate_limited() {
        let mut wifi = FakeWifi::down();
        let mut manager =
            ConnectivityManager::new(ConnectivityConfig::default(), Some(credentials()));
        manager.start(0, &mut wifi);
        manager.tick(0, &mut wifi);

        // a tick inside the interval does not look at the link
        wifi.set_up();
        manager.tick(500, &mut wifi);
        assert_eq!(manager.mode(), ConnectivityMode::StationConnecting);
        manager.tick(1_000, &mut wifi);
        assert_eq!(manager.mode(), ConnectivityMode::StationConnected);
    }
}
