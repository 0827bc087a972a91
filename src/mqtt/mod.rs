//! # MQTT Bridge
//!
//! Connects the bus core to the dashboard. Outbound events from the [`Publisher`] are
//! mapped to topics and published; inbound command topics are turned into raised
//! signals. The bridge never calls into a worker directly.
//!
//! ## Topics
//!
//! ```text
//! out  <prefix>/can/data          "<app_id>:<value>"
//! out  <prefix>/control           control identifier, e.g. "BTN_ENTER"
//! out  <prefix>/most/message      JSON record of a decoded MOST message
//! out  <prefix>/<module>/state    "true" | "false"
//! out  <prefix>/<module>/link     "true" | "false"   (transport connected)
//! out  <prefix>/sys/ignition      "true" | "false"
//! out  <prefix>/sys/display       "true" | "false"
//!
//! in   <prefix>/<module>/toggle   start or stop a module
//! in   <prefix>/<module>/ping     publish every module state
//! in   <prefix>/sys/task          "quit" | "restart" | "hdmi" | "ign"
//! in   <prefix>/most/force_switch
//! ```
//!
//! [`Publisher`]: crate::publish::Publisher

pub mod bridge;

pub use bridge::{ConnectionState, MqttBridge, MqttStatus};

use crate::publish::{Outbound, StatusEvent};
use crate::supervisor::{ModuleKind, Signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("Failed to encode MOST message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Unknown command topic: {0}")]
    UnknownTopic(String),

    #[error("Unknown system task: {0:?}")]
    UnknownTask(String),
}

/// Topic layout under one prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.prefix, suffix)
    }

    /// Topic filters the bridge subscribes to
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.topic("+/toggle"),
            self.topic("+/ping"),
            self.topic("sys/task"),
            self.topic("most/force_switch"),
        ]
    }

    /// Topic and payload of an outbound event
    pub fn encode(&self, event: &Outbound) -> Result<(String, Vec<u8>), MqttError> {
        let encoded = match event {
            Outbound::Telemetry(t) => (self.topic("can/data"), t.payload().into_bytes()),
            Outbound::Control { id, .. } => (self.topic("control"), id.as_str().as_bytes().to_vec()),
            Outbound::Most(message) => (self.topic("most/message"), serde_json::to_vec(message)?),
            Outbound::Status(status) => match status {
                StatusEvent::ModuleState { module, alive } => {
                    (self.topic(&format!("{}/state", module)), flag(*alive))
                }
                StatusEvent::Connection { module, connected } => {
                    (self.topic(&format!("{}/link", module)), flag(*connected))
                }
                StatusEvent::Ignition { on } => (self.topic("sys/ignition"), flag(*on)),
                StatusEvent::Display { on } => (self.topic("sys/display"), flag(*on)),
            },
        };
        Ok(encoded)
    }

    /// Signal raised by an inbound command
    pub fn decode_command(&self, topic: &str, payload: &[u8]) -> Result<Signal, MqttError> {
        let unknown = || MqttError::UnknownTopic(topic.to_string());
        let suffix = topic
            .strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(unknown)?;

        match suffix.split_once('/') {
            Some(("sys", "task")) => {
                let task = String::from_utf8_lossy(payload);
                match task.trim() {
                    "quit" => Ok(Signal::Exit),
                    "restart" => Ok(Signal::Restart),
                    "hdmi" => Ok(Signal::DisplayToggle),
                    "ign" => Ok(Signal::IgnitionQuery),
                    other => Err(MqttError::UnknownTask(other.to_string())),
                }
            }
            Some(("most", "force_switch")) => Ok(Signal::MostForceSwitch),
            Some((module, "toggle")) => module
                .parse::<ModuleKind>()
                .map(|kind| kind.toggle_signal())
                .map_err(|_| unknown()),
            Some((module, "ping")) if module.parse::<ModuleKind>().is_ok() => {
                Ok(Signal::StatusQuery)
            }
            _ => Err(unknown()),
        }
    }
}

fn flag(value: bool) -> Vec<u8> {
    if value { b"true".to_vec() } else { b"false".to_vec() }
}

/// Consumes outbound events when no broker is configured
pub async fn drain(mut outbound: mpsc::Receiver<Outbound>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = outbound.recv() => match event {
                Some(event) => debug!("Unpublished: {:?}", event),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlId;
    use crate::publish::{ControlSource, TelemetryEvent};

    #[test]
    fn outbound_topics() {
        let topics = Topics::new("vlink/");
        assert_eq!(
            topics
                .encode(&Outbound::Telemetry(TelemetryEvent::new("boost", 1.5)))
                .unwrap(),
            ("vlink/can/data".to_string(), b"boost:1.5".to_vec())
        );
        assert_eq!(
            topics
                .encode(&Outbound::Control {
                    source: ControlSource::Lin,
                    id: ControlId::Up
                })
                .unwrap(),
            ("vlink/control".to_string(), b"BTN_UP".to_vec())
        );
        assert_eq!(
            topics
                .encode(&Outbound::Status(StatusEvent::ModuleState {
                    module: "can".to_string(),
                    alive: false
                }))
                .unwrap(),
            ("vlink/can/state".to_string(), b"false".to_vec())
        );
    }

    #[test]
    fn commands_become_signals() {
        let topics = Topics::new("vlink");
        let decode = |topic: &str, payload: &str| topics.decode_command(topic, payload.as_bytes());

        assert_eq!(decode("vlink/sys/task", "quit").unwrap(), Signal::Exit);
        assert_eq!(decode("vlink/sys/task", "restart\n").unwrap(), Signal::Restart);
        assert_eq!(decode("vlink/sys/task", "hdmi").unwrap(), Signal::DisplayToggle);
        assert_eq!(decode("vlink/sys/task", "ign").unwrap(), Signal::IgnitionQuery);
        assert_eq!(decode("vlink/lin/toggle", "").unwrap(), Signal::ToggleLin);
        assert_eq!(decode("vlink/ign/toggle", "").unwrap(), Signal::ToggleIgnition);
        assert_eq!(decode("vlink/most/ping", "").unwrap(), Signal::StatusQuery);
        assert_eq!(decode("vlink/most/force_switch", "").unwrap(), Signal::MostForceSwitch);

        assert!(matches!(decode("vlink/sys/task", "reboot"), Err(MqttError::UnknownTask(_))));
        assert!(matches!(decode("vlink/fan/toggle", ""), Err(MqttError::UnknownTopic(_))));
        assert!(matches!(decode("other/can/toggle", ""), Err(MqttError::UnknownTopic(_))));
    }
}
