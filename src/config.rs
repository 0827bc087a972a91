//! On-disk configuration
//!
//! Every bus has its own TOML file under `<config_dir>/v-link/`. The structs here mirror
//! the files one to one; validation into domain types happens in the owning module
//! (`catalog`, `control`, `lin`, `most`).

use crate::catalog::{SensorRole, Transport};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const CONFIG_DIR_NAME: &str = "v-link";
pub const CONFIG_DIR_ENV: &str = "VLINK_CONFIG_DIR";

const SYSTEM_FILE: &str = "system.toml";
const CAN_FILE: &str = "can.toml";
const LIN_FILE: &str = "lin.toml";
const MOST_FILE: &str = "most.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Parses `"0x7E8"` or `"7E8"`
pub fn parse_hex_u32(text: &str) -> Option<u32> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

pub fn parse_hex_byte(text: &str) -> Option<u8> {
    parse_hex_u32(text).and_then(|value| u8::try_from(value).ok())
}

pub fn parse_hex_bytes(texts: &[String]) -> Option<Vec<u8>> {
    texts.iter().map(|text| parse_hex_byte(text)).collect()
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct InterfaceEntry {
    pub channel: String,
    #[serde(default, alias = "bustype")]
    pub transport: Transport,
    pub bitrate: u32,
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SensorEntry {
    pub interface: String,
    #[serde(rename = "type")]
    pub role: SensorRole,
    pub req_id: String,
    pub rep_id: String,
    pub target: String,
    pub action: String,
    pub parameter: Vec<String>,
    pub scale: String,
    #[serde(default)]
    pub is_16bit: bool,
    pub app_id: String,
    pub refresh_rate: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One control payload or a list of alternative payloads
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PayloadSpec {
    Single(Vec<String>),
    Multiple(Vec<Vec<String>>),
}

impl PayloadSpec {
    pub fn payloads(&self) -> Vec<&[String]> {
        match self {
            PayloadSpec::Single(bytes) => vec![bytes.as_slice()],
            PayloadSpec::Multiple(lists) => lists.iter().map(Vec::as_slice).collect(),
        }
    }
}

/// Timing of the input state machine
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct InputTiming {
    /// Milliseconds without a decoded identifier before a press is released
    #[serde(default = "InputTiming::default_click_timeout")]
    pub click_timeout: u64,
    /// Milliseconds a press must be held to trigger its long-press action
    #[serde(default = "InputTiming::default_long_press")]
    pub long_press_duration: u64,
    /// Pointer delta per tick in mouse mode
    #[serde(default = "InputTiming::default_mouse_speed")]
    pub mouse_speed: i32,
}

impl InputTiming {
    fn default_click_timeout() -> u64 {
        300
    }

    fn default_long_press() -> u64 {
        2000
    }

    fn default_mouse_speed() -> i32 {
        8
    }

    pub fn click_timeout(&self) -> Duration {
        Duration::from_millis(self.click_timeout)
    }

    pub fn long_press_duration(&self) -> Duration {
        Duration::from_millis(self.long_press_duration)
    }
}

impl Default for InputTiming {
    fn default() -> Self {
        Self {
            click_timeout: Self::default_click_timeout(),
            long_press_duration: Self::default_long_press(),
            mouse_speed: Self::default_mouse_speed(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct CanControlSettings {
    #[serde(default)]
    pub enabled: bool,
    pub interface: String,
    pub rep_id: String,
    #[serde(default)]
    pub zero_message: Vec<String>,
    pub control_byte_count: usize,
    #[serde(default)]
    pub button: BTreeMap<String, PayloadSpec>,
    #[serde(default)]
    pub joystick: BTreeMap<String, PayloadSpec>,
    #[serde(flatten)]
    pub timing: InputTiming,
}

/// Contents of `can.toml`.
///
/// Interfaces, sensors and the control block stay raw TOML values so each one can be
/// validated on its own. A malformed entry costs only that entry.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct CanSettings {
    #[serde(default)]
    pub interfaces: Vec<toml::Value>,
    #[serde(default)]
    pub sensors: BTreeMap<String, toml::Value>,
    pub controls: Option<toml::Value>,
}

impl CanSettings {
    /// The `[controls]` block, if present
    pub fn control_settings(&self) -> Option<Result<CanControlSettings, toml::de::Error>> {
        self.controls.clone().map(toml::Value::try_into)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct LinCommands {
    #[serde(default)]
    pub button: BTreeMap<String, PayloadSpec>,
    #[serde(default)]
    pub joystick: BTreeMap<String, PayloadSpec>,
}

/// Contents of `lin.toml`
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct LinSettings {
    #[serde(default = "LinSettings::default_port")]
    pub port: String,
    #[serde(default = "LinSettings::default_baudrate")]
    pub baudrate: u32,
    pub sync_id: String,
    pub swm_id: String,
    pub zero_code: String,
    /// Trace file replayed instead of reading the serial port
    pub replay: Option<PathBuf>,
    #[serde(default = "LinSettings::default_replay_interval")]
    pub replay_interval_ms: u64,
    #[serde(default)]
    pub commands: LinCommands,
    #[serde(flatten)]
    pub timing: InputTiming,
}

impl LinSettings {
    fn default_port() -> String {
        "/dev/ttyAMA0".to_string()
    }

    fn default_baudrate() -> u32 {
        9600
    }

    fn default_replay_interval() -> u64 {
        10
    }
}

/// Contents of `most.toml`
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MostSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "MostSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "MostSettings::default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "MostSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    #[serde(default = "MostSettings::default_rediscover_interval")]
    pub rediscover_interval_s: u64,
    #[serde(default = "MostSettings::default_max_connect_attempts")]
    pub max_connect_attempts: u32,
}

impl MostSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn rediscover_interval(&self) -> Duration {
        Duration::from_secs(self.rediscover_interval_s)
    }

    fn default_vendor_id() -> u16 {
        51966
    }

    fn default_baudrate() -> u32 {
        921_600
    }

    fn default_read_timeout() -> u64 {
        200
    }

    fn default_rediscover_interval() -> u64 {
        10
    }

    fn default_max_connect_attempts() -> u32 {
        5
    }
}

impl Default for MostSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_id: Self::default_vendor_id(),
            baudrate: Self::default_baudrate(),
            read_timeout_ms: Self::default_read_timeout(),
            rediscover_interval_s: Self::default_rediscover_interval(),
            max_connect_attempts: Self::default_max_connect_attempts(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MqttSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "MqttSettings::default_host")]
    pub host: String,
    #[serde(default = "MqttSettings::default_port")]
    pub port: u16,
    #[serde(default = "MqttSettings::default_client_id")]
    pub client_id: String,
    #[serde(default = "MqttSettings::default_prefix")]
    pub topic_prefix: String,
    pub user: Option<String>,
    pub password: Option<String>,
    #[serde(default = "MqttSettings::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "MqttSettings::default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl MqttSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn default_host() -> String {
        "localhost".to_string()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_client_id() -> String {
        "v-link".to_string()
    }

    fn default_prefix() -> String {
        "vlink".to_string()
    }

    fn default_max_retries() -> u32 {
        10
    }

    fn default_retry_backoff() -> u64 {
        500
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: Self::default_host(),
            port: Self::default_port(),
            client_id: Self::default_client_id(),
            topic_prefix: Self::default_prefix(),
            user: None,
            password: None,
            max_retries: Self::default_max_retries(),
            retry_backoff_ms: Self::default_retry_backoff(),
        }
    }
}

/// Pin level that means "ignition off"
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffLevel {
    #[default]
    High,
    Low,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct IgnitionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "IgnitionSettings::default_pin")]
    pub pin: u8,
    #[serde(default)]
    pub off_level: OffLevel,
    #[serde(default = "IgnitionSettings::default_poll")]
    pub poll_interval_ms: u64,
}

impl IgnitionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn default_pin() -> u8 {
        1
    }

    fn default_poll() -> u64 {
        1000
    }
}

impl Default for IgnitionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pin: Self::default_pin(),
            off_level: OffLevel::default(),
            poll_interval_ms: Self::default_poll(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SupervisorSettings {
    /// Signal polling period
    #[serde(default = "SupervisorSettings::default_tick")]
    pub tick_ms: u64,
    /// How long a stopping worker may take before it is reported stopped anyway
    #[serde(default = "SupervisorSettings::default_grace")]
    pub grace_ms: u64,
    /// Period of the module state table in the debug log
    #[serde(default = "SupervisorSettings::default_status_period")]
    pub status_period_s: u64,
}

impl SupervisorSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn status_period(&self) -> Duration {
        Duration::from_secs(self.status_period_s)
    }

    fn default_tick() -> u64 {
        100
    }

    fn default_grace() -> u64 {
        2000
    }

    fn default_status_period() -> u64 {
        30
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            tick_ms: Self::default_tick(),
            grace_ms: Self::default_grace(),
            status_period_s: Self::default_status_period(),
        }
    }
}

/// Contents of `system.toml`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct SystemSettings {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub ignition: IgnitionSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

/// Everything loaded at startup. Immutable afterwards.
#[derive(Debug, Default)]
pub struct AppConfig {
    pub system: SystemSettings,
    pub can: Option<CanSettings>,
    pub lin: Option<LinSettings>,
    pub most: Option<MostSettings>,
    /// Files that could not be used. Logged once logging is up.
    pub rejected: Vec<ConfigLoadError>,
}

impl AppConfig {
    /// Resolves the configuration directory: explicit path, then `VLINK_CONFIG_DIR`,
    /// then `<config_dir>/v-link`
    pub fn resolve_dir(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigLoadError> {
        if let Some(dir) = explicit {
            return Ok(dir);
        }
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir()
            .map(|dir| dir.join(CONFIG_DIR_NAME))
            .ok_or(ConfigLoadError::NoConfigDir)
    }

    /// Loads every file under `dir`.
    ///
    /// A file that cannot be read or parsed leaves its module disabled (or the system
    /// settings at their defaults) and is recorded in [`AppConfig::rejected`].
    pub async fn load(dir: &Path) -> Self {
        let mut rejected = Vec::new();

        let system = accept(load_file::<SystemSettings>(dir, SYSTEM_FILE).await, &mut rejected)
            .unwrap_or_default();
        let can = accept(load_file::<CanSettings>(dir, CAN_FILE).await, &mut rejected);
        let lin = accept(load_file::<LinSettings>(dir, LIN_FILE).await, &mut rejected);
        let most = accept(load_file::<MostSettings>(dir, MOST_FILE).await, &mut rejected);

        Self {
            system,
            can,
            lin,
            most,
            rejected,
        }
    }

    /// Logs what was loaded and what was rejected
    pub fn report(&self, dir: &Path) {
        info!("Configuration loaded from {}", dir.display());
        for e in &self.rejected {
            error!("{}, using defaults or leaving the module disabled", e);
        }
        for (name, present) in [
            ("can", self.can.is_some()),
            ("lin", self.lin.is_some()),
            ("most", self.most.is_some()),
        ] {
            if !present {
                warn!("No {} settings found, module stays disabled", name);
            }
        }
    }

    /// Input timing: the CAN control block wins, then the LIN settings, then defaults
    pub fn input_timing(&self) -> InputTiming {
        if let Some(Ok(controls)) = self.can.as_ref().and_then(CanSettings::control_settings) {
            if controls.enabled {
                return controls.timing;
            }
        }
        if let Some(lin) = &self.lin {
            return lin.timing.clone();
        }
        InputTiming::default()
    }
}

fn accept<T>(
    loaded: Result<Option<T>, ConfigLoadError>,
    rejected: &mut Vec<ConfigLoadError>,
) -> Option<T> {
    loaded.unwrap_or_else(|e| {
        rejected.push(e);
        None
    })
}

async fn load_file<T: DeserializeOwned>(
    dir: &Path,
    file: &str,
) -> Result<Option<T>, ConfigLoadError> {
    let path = dir.join(file);

    let exists = tokio::fs::try_exists(&path)
        .await
        .map_err(|source| ConfigLoadError::Read {
            path: path.clone(),
            source,
        })?;
    if !exists {
        debug!("{} does not exist", path.display());
        return Ok(None);
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|source| ConfigLoadError::Read {
            path: path.clone(),
            source,
        })?;

    let parsed = toml::from_str(&content).map_err(|source| ConfigLoadError::Parse {
        path: path.clone(),
        source,
    })?;
    debug!("{} loaded", file);
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_with_and_without_prefix() {
        assert_eq!(parse_hex_u32("0x7E8"), Some(0x7E8));
        assert_eq!(parse_hex_u32("7e8"), Some(0x7E8));
        assert_eq!(parse_hex_u32(" 0X1FFFFFFF "), Some(0x1FFF_FFFF));
        assert_eq!(parse_hex_u32("0x"), None);
        assert_eq!(parse_hex_u32("g1"), None);
        assert_eq!(parse_hex_byte("0x100"), None);
        assert_eq!(parse_hex_byte("0xff"), Some(0xFF));
    }

    #[test]
    fn payload_spec_accepts_single_and_multiple() {
        #[derive(Deserialize)]
        struct Table {
            button: BTreeMap<String, PayloadSpec>,
        }

        let table: Table = toml::from_str(
            r#"
            [button]
            BTN_ENTER = ["0x01", "0x02"]
            BTN_BACK = [["0x03", "0x04"], ["0x05", "0x06"]]
            "#,
        )
        .unwrap();

        assert_eq!(table.button["BTN_ENTER"].payloads().len(), 1);
        assert_eq!(table.button["BTN_BACK"].payloads().len(), 2);
        assert_eq!(
            parse_hex_bytes(table.button["BTN_BACK"].payloads()[1]),
            Some(vec![0x05, 0x06])
        );
    }

    #[test]
    fn system_settings_default_when_empty() {
        let settings: SystemSettings = toml::from_str("").unwrap();
        assert_eq!(settings, SystemSettings::default());
        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.supervisor.tick_ms, 100);
        assert_eq!(settings.ignition.off_level, OffLevel::High);
    }

    #[tokio::test]
    async fn missing_files_leave_modules_disabled() {
        let dir = std::env::temp_dir().join(format!("vlink-config-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(SYSTEM_FILE), "verbose = true\n")
            .await
            .unwrap();

        let config = AppConfig::load(&dir).await;
        assert!(config.rejected.is_empty());
        assert!(config.system.verbose);
        assert!(config.can.is_none());
        assert!(config.lin.is_none());
        assert_eq!(config.input_timing(), InputTiming::default());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn unparsable_file_disables_only_its_module() {
        let dir = std::env::temp_dir().join(format!("vlink-config-bad-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(MOST_FILE), "baudrate = \"fast\"\n")
            .await
            .unwrap();
        tokio::fs::write(dir.join(SYSTEM_FILE), "verbose = [\n")
            .await
            .unwrap();
        tokio::fs::write(
            dir.join(LIN_FILE),
            "sync_id = \"0x80\"\nswm_id = \"0x20\"\nzero_code = \"0x00\"\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load(&dir).await;
        assert!(config.most.is_none());
        assert!(config.lin.is_some());
        assert_eq!(config.system, SystemSettings::default());
        assert_eq!(config.rejected.len(), 2);
        assert!(config.rejected.iter().any(|e| e.to_string().contains(MOST_FILE)));
        assert!(config.rejected.iter().any(|e| e.to_string().contains(SYSTEM_FILE)));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_can_entries_do_not_reject_the_file() {
        let dir = std::env::temp_dir().join(format!("vlink-config-can-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join(CAN_FILE),
            r#"
            [[interfaces]]
            channel = "can0"
            bitrate = 500000

            [[interfaces]]
            channel = "can1"

            [controls]
            enabled = true
            interface = "can0"

            [sensors.boost]
            interface = "can0"
            type = "diagnostic"
            req_id = "0x6F1"
            rep_id = "0x612"
            target = "0x12"
            action = "0x22"
            parameter = ["0x10", "0x00"]
            scale = "value"
            app_id = "boost"
            "#,
        )
        .await
        .unwrap();

        let config = AppConfig::load(&dir).await;
        assert!(config.rejected.is_empty());
        let can = config.can.as_ref().unwrap();
        assert_eq!(can.interfaces.len(), 2);
        assert!(matches!(can.control_settings(), Some(Err(_))));
        assert_eq!(config.input_timing(), InputTiming::default());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
