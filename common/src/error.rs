use thiserror::Error;

/// Malformed inbound payload. The payload is dropped and no state changes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("config payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid power value `{0}`")]
    InvalidPower(String),
    #[error("breakpoint entry {index} has a non-finite spread")]
    NonFiniteThreshold { index: usize },
    #[error("wifiSSID is longer than {max} bytes")]
    SsidTooLong { max: usize },
    #[error("wifiPassword is longer than {max} bytes")]
    PasswordTooLong { max: usize },
    #[error("unrecognised timezone `{0}`")]
    InvalidTimezone(String),
}

/// Collaborator faults. The loop logs them and keeps its in-memory values.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("sensor read failed: {0}")]
    Sensor(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("wifi driver failure: {0}")]
    Wifi(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("heater output failure: {0}")]
    Output(String),
    #[error("clock: {0}")]
    Clock(String),
}
