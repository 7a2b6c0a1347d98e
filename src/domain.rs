//! ==============================================================================
//! domain.rs - garden, sensor and device types
//! ==============================================================================
//!
//! purpose:
//!     the shapes shared by every part of the live view: which garden we are
//!     looking at, its latest readings, and the on/off state of its actuators.
//!
//! naming:
//!     devices have two key namespaces.
//!     - DeviceKey is the internal one (fan, light, pump, pump2, auto) and
//!       indexes DeviceStateSet.
//!     - CommandKey is the command-protocol one (FAN, LIGHT, PUMP, PUMP_2)
//!       and indexes the cooldown registry.
//!     `PUMP_2` is the canonical wire spelling; `PUMP2` is accepted as a
//!     legacy alias and never emitted.
//!
//! ==============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LiveError;

// ==============================================================================
// gardens
// ==============================================================================

/// a user-owned garden as listed by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GardenRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// whether the esp32 is currently connected to the backend
    #[serde(default, alias = "is_connected")]
    pub connected: bool,
    #[serde(default)]
    pub last_connected: Option<String>,
    #[serde(default)]
    pub has_camera: bool,
    #[serde(default)]
    pub device_serial: Option<String>,
}

// ==============================================================================
// sensors
// ==============================================================================

/// the current reading for the active garden
///
/// every value is optional: a garden without a light sensor simply never
/// reports `light`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub light: Option<f64>,
    #[serde(default, alias = "soil_moisture")]
    pub soil: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// partial reading carried by a `sensor_data_update` push event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub garden_id: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub light: Option<f64>,
    #[serde(default, alias = "soil_moisture")]
    pub soil: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl SensorSnapshot {
    /// overwrite only the fields the update carries
    ///
    /// a field sent as `null` is treated the same as an absent one.
    pub fn merge(&mut self, update: &SensorUpdate) {
        if let Some(v) = update.temperature {
            self.temperature = Some(v);
        }
        if let Some(v) = update.humidity {
            self.humidity = Some(v);
        }
        if let Some(v) = update.light {
            self.light = Some(v);
        }
        if let Some(v) = update.soil {
            self.soil = Some(v);
        }
        if let Some(ts) = &update.timestamp {
            self.timestamp = Some(ts.clone());
        }
    }
}

// ==============================================================================
// devices
// ==============================================================================

/// internal device key, indexes DeviceStateSet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKey {
    Fan,
    Light,
    Pump,
    Pump2,
    Auto,
}

impl DeviceKey {
    /// map a wire device name onto the internal key
    ///
    /// case-insensitive, underscores ignored, so `PUMP_2`, `PUMP2` and
    /// `pump2` all land on `Pump2`.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "fan" => Some(Self::Fan),
            "light" => Some(Self::Light),
            "pump" => Some(Self::Pump),
            "pump2" => Some(Self::Pump2),
            "auto" | "automode" => Some(Self::Auto),
            _ => None,
        }
    }

    /// the command-protocol key, if this device takes manual commands
    pub fn command_key(self) -> Option<CommandKey> {
        match self {
            Self::Fan => Some(CommandKey::Fan),
            Self::Light => Some(CommandKey::Light),
            Self::Pump => Some(CommandKey::Pump),
            Self::Pump2 => Some(CommandKey::Pump2),
            Self::Auto => None,
        }
    }
}

/// command-protocol device key, indexes the cooldown registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CommandKey {
    Fan,
    Light,
    Pump,
    Pump2,
}

impl CommandKey {
    pub const ALL: [CommandKey; 4] = [Self::Fan, Self::Light, Self::Pump, Self::Pump2];

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Fan => "FAN",
            Self::Light => "LIGHT",
            Self::Pump => "PUMP",
            Self::Pump2 => "PUMP_2",
        }
    }

    pub fn device_key(self) -> DeviceKey {
        match self {
            Self::Fan => DeviceKey::Fan,
            Self::Light => DeviceKey::Light,
            Self::Pump => DeviceKey::Pump,
            Self::Pump2 => DeviceKey::Pump2,
        }
    }
}

impl FromStr for CommandKey {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceKey::from_wire(s)
            .and_then(DeviceKey::command_key)
            .ok_or_else(|| LiveError::UnknownDevice(s.to_string()))
    }
}

impl TryFrom<String> for CommandKey {
    type Error = LiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandKey> for String {
    fn from(key: CommandKey) -> Self {
        key.as_wire().to_string()
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// on/off state of every actuator of one garden
///
/// the backend calls the auto flag `auto_mode`; cached entries written by
/// older clients used `auto`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStateSet {
    #[serde(default)]
    pub fan: bool,
    #[serde(default)]
    pub light: bool,
    #[serde(default)]
    pub pump: bool,
    #[serde(default)]
    pub pump2: bool,
    #[serde(default, rename = "auto_mode", alias = "auto")]
    pub auto: bool,
}

impl DeviceStateSet {
    pub fn get(&self, key: DeviceKey) -> bool {
        match key {
            DeviceKey::Fan => self.fan,
            DeviceKey::Light => self.light,
            DeviceKey::Pump => self.pump,
            DeviceKey::Pump2 => self.pump2,
            DeviceKey::Auto => self.auto,
        }
    }

    pub fn set(&mut self, key: DeviceKey, on: bool) {
        match key {
            DeviceKey::Fan => self.fan = on,
            DeviceKey::Light => self.light = on,
            DeviceKey::Pump => self.pump = on,
            DeviceKey::Pump2 => self.pump2 = on,
            DeviceKey::Auto => self.auto = on,
        }
    }
}
