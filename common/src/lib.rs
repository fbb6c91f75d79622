pub mod characteristics;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod dew;
pub mod engine;
pub mod error;
pub mod hal;
pub mod logbuf;
pub mod staging;
pub mod table;
pub mod timezone;
pub mod types;

pub use characteristics::*;
pub use command::{Command, ConfigUpdate, TableEntryUpdate};
pub use config::{
    ConnectivityConfig, ControllerConfig, NetworkConfig, PersistedSettings, RuntimeConfig,
};
pub use connectivity::{ConnectivityManager, ConnectivityState, NetAction};
pub use dew::{dew_point_c, margin_c, select_power, PowerRequest};
pub use engine::{Devices, DewController, FIRMWARE_VERSION};
pub use error::{DecodeError, HardwareError};
pub use hal::{
    Clock, ConfigStore, EnvironmentSensor, HeaterOutput, LinkStatus, PeerTracker, ScanStatus,
    StationCredentials, WifiDriver, WirelessTransport,
};
pub use logbuf::LogBuffer;
pub use staging::{Inbox, StagingSlot};
pub use table::{Breakpoint, BreakpointTable, TableRecord, MAX_BREAKPOINTS};
pub use timezone::{PosixTz, Timezone};
pub use types::{
    ConfigView, ConnectivityMode, ControlSource, ControlState, DeviceInfo, Reading, Snapshot,
    StatusPayload, StatusReport,
};
