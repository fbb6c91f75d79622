use serde::{Deserialize, Serialize};

use crate::{
    error::DecodeError,
    table::{Breakpoint, MAX_BREAKPOINTS},
};

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `power:<0-100>`
    ManualPower(u8),
    Auto,
    /// `toggle`; flips heater enable against the loop's own state.
    ToggleHeater,
}

impl Command {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        if text.eq_ignore_ascii_case("toggle") {
            return Ok(Self::ToggleHeater);
        }

        let Some((verb, value)) = text.split_once(':') else {
            return Err(DecodeError::UnknownCommand(text.to_string()));
        };
        if !verb.trim().eq_ignore_ascii_case("power") {
            return Err(DecodeError::UnknownCommand(text.to_string()));
        }

        let value = value.trim();
        let percent = value
            .parse::<f32>()
            .ok()
            .filter(|percent| percent.is_finite())
            .ok_or_else(|| DecodeError::InvalidPower(value.to_string()))?;
        Ok(Self::ManualPower(clamp_percent(percent)))
    }

    pub fn encode(self) -> String {
        match self {
            Self::ManualPower(percent) => format!("power:{percent}"),
            Self::Auto => "auto".to_string(),
            Self::ToggleHeater => "toggle".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableEntryUpdate {
    #[serde(alias = "threshold")]
    pub spread: f32,
    pub power: f64,
}

/// Absent fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(
        rename = "heaterEnabled",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub heater_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<TableEntryUpdate>>,
    #[serde(rename = "wifiSSID", default, skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,
    #[serde(
        rename = "wifiPassword",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub wifi_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ConfigUpdate {
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let update: Self = serde_json::from_str(text)?;
        update.validate()?;
        Ok(update)
    }

    pub fn encode(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if let Some(rows) = &self.table {
            if let Some(index) = rows.iter().position(|row| !row.spread.is_finite()) {
                return Err(DecodeError::NonFiniteThreshold { index });
            }
        }
        if self
            .wifi_ssid
            .as_ref()
            .is_some_and(|ssid| ssid.trim().len() > MAX_SSID_LEN)
        {
            return Err(DecodeError::SsidTooLong { max: MAX_SSID_LEN });
        }
        if self
            .wifi_password
            .as_ref()
            .is_some_and(|pass| pass.len() > MAX_PASSWORD_LEN)
        {
            return Err(DecodeError::PasswordTooLong {
                max: MAX_PASSWORD_LEN,
            });
        }
        Ok(())
    }

    /// Table rows clamped to the stored representation, at most
    /// [`MAX_BREAKPOINTS`] of them in the order they were written.
    pub fn table_rows(&self) -> Option<Vec<Breakpoint>> {
        self.table.as_ref().map(|rows| {
            rows.iter()
                .take(MAX_BREAKPOINTS)
                .map(|row| Breakpoint::new(row.spread, clamp_percent(row.power as f32)))
                .collect()
        })
    }
}

fn clamp_percent(value: f32) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}
