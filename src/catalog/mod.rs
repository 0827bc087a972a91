//! Sensor catalog for the differential (CAN) bus
//!
//! Turns the declarative `can.toml` description into immutable interface and sensor
//! definitions:
//!
//! ```text
//! can.toml ──► CanSettings ──► SensorCatalog
//!                               ├── InterfaceDefinition (enabled interfaces only)
//!                               └── SensorDefinition    (per interface, validated)
//! ```
//!
//! A sensor entry that fails validation is logged and skipped; the rest of the catalog
//! still loads.

pub mod formula;

use crate::config::{parse_hex_byte, parse_hex_u32, CanSettings, InterfaceEntry, SensorEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use formula::{FormulaError, ScaleFormula};

/// Base of the data-length byte in every request payload
pub const DLC_BASE: u8 = 0xC8;

/// Refresh interval used when a sensor does not specify one
pub const DEFAULT_REFRESH_SECS: f64 = 0.5;

/// Fixed tail of every request payload after the parameter bytes
const REQUEST_TAIL: [u8; 3] = [0x01, 0x00, 0x00];

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("Sensor '{sensor}': field '{field}' is not a valid hex value: '{value}'")]
    InvalidHex {
        sensor: String,
        field: &'static str,
        value: String,
    },

    #[error("Sensor '{sensor}': expected 2 parameter bytes, got {count}")]
    ParameterCount { sensor: String, count: usize },

    #[error("Sensor '{sensor}': invalid scale formula '{formula}': {source}")]
    InvalidScale {
        sensor: String,
        formula: String,
        #[source]
        source: FormulaError,
    },

    #[error("Sensor '{sensor}': refresh rate must be positive, got {rate}")]
    InvalidRefreshRate { sensor: String, rate: f64 },

    #[error("Sensor '{sensor}': malformed entry: {reason}")]
    Malformed { sensor: String, reason: String },

    #[error("Interface entry {index}: malformed entry: {reason}")]
    MalformedInterface { index: usize, reason: String },
}

/// Bus transport backing an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Socketcan,
    Virtual,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Socketcan => write!(f, "socketcan"),
            Transport::Virtual => write!(f, "virtual"),
        }
    }
}

/// Whether a sensor is polled or only listened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorRole {
    /// Requested periodically by the interface's sender
    Diagnostic,
    /// Appears on the bus unsolicited
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDefinition {
    pub channel: String,
    pub transport: Transport,
    pub bitrate: u32,
    pub is_extended: bool,
}

impl From<&InterfaceEntry> for InterfaceDefinition {
    fn from(entry: &InterfaceEntry) -> Self {
        Self {
            channel: entry.channel.clone(),
            transport: entry.transport,
            bitrate: entry.bitrate,
            is_extended: entry.is_extended,
        }
    }
}

/// A validated sensor.
///
/// Immutable after load. The time a request was last sent lives with the interface's
/// sender task, which is the only writer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorDefinition {
    pub name: String,
    pub interface: String,
    pub request_id: u32,
    pub reply_id: u32,
    pub target: u8,
    pub action: u8,
    pub parameter: [u8; 2],
    pub data_length: u8,
    pub is_16bit: bool,
    pub scale: ScaleFormula,
    pub refresh: Duration,
    pub role: SensorRole,
    pub app_id: String,
}

impl SensorDefinition {
    /// Validates one raw entry
    pub fn from_entry(name: &str, entry: &SensorEntry) -> Result<Self, CatalogError> {
        let hex_u32 = |field: &'static str, value: &str| {
            parse_hex_u32(value).ok_or_else(|| CatalogError::InvalidHex {
                sensor: name.to_string(),
                field,
                value: value.to_string(),
            })
        };
        let hex_u8 = |field: &'static str, value: &str| {
            parse_hex_byte(value).ok_or_else(|| CatalogError::InvalidHex {
                sensor: name.to_string(),
                field,
                value: value.to_string(),
            })
        };

        let request_id = hex_u32("req_id", &entry.req_id)?;
        let reply_id = hex_u32("rep_id", &entry.rep_id)?;
        let target = hex_u8("target", &entry.target)?;
        let action = hex_u8("action", &entry.action)?;

        if entry.parameter.len() != 2 {
            return Err(CatalogError::ParameterCount {
                sensor: name.to_string(),
                count: entry.parameter.len(),
            });
        }
        let parameter = [
            hex_u8("parameter", &entry.parameter[0])?,
            hex_u8("parameter", &entry.parameter[1])?,
        ];

        let scale = ScaleFormula::parse(&entry.scale).map_err(|source| CatalogError::InvalidScale {
            sensor: name.to_string(),
            formula: entry.scale.clone(),
            source,
        })?;

        let rate = entry.refresh_rate.unwrap_or(DEFAULT_REFRESH_SECS);
        if !(rate.is_finite() && rate > 0.0) {
            return Err(CatalogError::InvalidRefreshRate {
                sensor: name.to_string(),
                rate,
            });
        }

        Ok(Self {
            name: name.to_string(),
            interface: entry.interface.clone(),
            request_id,
            reply_id,
            target,
            action,
            parameter,
            data_length: data_length(reply_id, target, action, parameter),
            is_16bit: entry.is_16bit,
            scale,
            refresh: Duration::from_secs_f64(rate),
            role: entry.role,
            app_id: entry.app_id.clone(),
        })
    }

    /// Outgoing request payload:
    /// `[dlc, target, action, parameter0, parameter1, 0x01, 0x00, 0x00]`
    pub fn request_payload(&self) -> [u8; 8] {
        [
            self.data_length,
            self.target,
            self.action,
            self.parameter[0],
            self.parameter[1],
            REQUEST_TAIL[0],
            REQUEST_TAIL[1],
            REQUEST_TAIL[2],
        ]
    }
}

/// Data-length byte: the base offset plus the number of non-zero fields among
/// reply id, target, action and both parameter bytes.
pub fn data_length(reply_id: u32, target: u8, action: u8, parameter: [u8; 2]) -> u8 {
    let fields = [
        reply_id,
        target as u32,
        action as u32,
        parameter[0] as u32,
        parameter[1] as u32,
    ];
    DLC_BASE + fields.iter().filter(|field| **field != 0).count() as u8
}

/// Validated interfaces and sensors of one CAN configuration
#[derive(Debug, Clone, Default)]
pub struct SensorCatalog {
    interfaces: Vec<InterfaceDefinition>,
    sensors: HashMap<String, Vec<SensorDefinition>>,
}

impl SensorCatalog {
    /// Builds the catalog, skipping disabled or invalid entries
    pub fn load(settings: &CanSettings) -> Self {
        let mut interfaces: Vec<InterfaceDefinition> = Vec::new();
        let mut skipped = 0;

        for (index, raw) in settings.interfaces.iter().enumerate() {
            match Self::load_interface(index, raw) {
                Ok(Some(interface)) => interfaces.push(interface),
                Ok(None) => debug!("Interface entry {} is disabled", index),
                Err(e) => {
                    error!("Error loading interface: {}", e);
                    skipped += 1;
                }
            }
        }

        let mut sensors: HashMap<String, Vec<SensorDefinition>> = HashMap::new();

        for (name, raw) in &settings.sensors {
            match Self::load_sensor(name, raw) {
                Ok(Some(sensor)) => {
                    debug!("Loaded sensor '{}' on {}", name, sensor.interface);
                    sensors.entry(sensor.interface.clone()).or_default().push(sensor);
                }
                Ok(None) => debug!("Sensor '{}' is disabled", name),
                Err(e) => {
                    error!("Error loading sensor '{}': {}", name, e);
                    skipped += 1;
                }
            }
        }

        for channel in sensors.keys() {
            if !interfaces.iter().any(|iface| &iface.channel == channel) {
                warn!(
                    "Sensors configured for '{}' but the interface is missing or disabled",
                    channel
                );
            }
        }

        info!(
            "Sensor catalog loaded: {} interfaces, {} sensors, {} entries skipped",
            interfaces.len(),
            sensors.values().map(Vec::len).sum::<usize>(),
            skipped
        );

        Self { interfaces, sensors }
    }

    fn load_interface(
        index: usize,
        raw: &toml::Value,
    ) -> Result<Option<InterfaceDefinition>, CatalogError> {
        let entry: InterfaceEntry = raw.clone().try_into().map_err(|e: toml::de::Error| {
            CatalogError::MalformedInterface {
                index,
                reason: e.message().to_string(),
            }
        })?;

        Ok(entry.enabled.then(|| InterfaceDefinition::from(&entry)))
    }

    fn load_sensor(name: &str, raw: &toml::Value) -> Result<Option<SensorDefinition>, CatalogError> {
        let entry: SensorEntry = raw.clone().try_into().map_err(|e: toml::de::Error| {
            CatalogError::Malformed {
                sensor: name.to_string(),
                reason: e.message().to_string(),
            }
        })?;

        if !entry.enabled {
            return Ok(None);
        }

        SensorDefinition::from_entry(name, &entry).map(Some)
    }

    pub fn interfaces(&self) -> &[InterfaceDefinition] {
        &self.interfaces
    }

    pub fn sensors_for(&self, channel: &str) -> &[SensorDefinition] {
        self.sensors.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Sensors of one interface grouped by reply id, ordered by sensor name
    pub fn sensors_by_reply(&self, channel: &str) -> BTreeMap<u32, Vec<SensorDefinition>> {
        let mut grouped: BTreeMap<u32, Vec<SensorDefinition>> = BTreeMap::new();
        for sensor in self.sensors_for(channel) {
            grouped.entry(sensor.reply_id).or_default().push(sensor.clone());
        }
        grouped
    }
}
