//! Outbound publish sink shared by every worker
//!
//! Workers never talk to the transport directly. They push [`Outbound`] events into a
//! bounded channel through a cloneable [`Publisher`]; the MQTT bridge drains it. Publishing
//! never blocks, so blocking bus threads can use it too.

use crate::control::ControlId;
use crate::most::protocol::MostMessage;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;
use tracing::warn;

/// Bus a control event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSource {
    Can,
    Lin,
}

impl fmt::Display for ControlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlSource::Can => write!(f, "can"),
            ControlSource::Lin => write!(f, "lin"),
        }
    }
}

/// One decoded sensor value
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub app_id: String,
    pub value: f64,
    pub timestamp: DateTime<Local>,
}

impl TelemetryEvent {
    pub fn new(app_id: impl Into<String>, value: f64) -> Self {
        Self {
            app_id: app_id.into(),
            value,
            timestamp: Local::now(),
        }
    }

    /// Wire form `"<application-id>:<value>"`
    pub fn payload(&self) -> String {
        format!("{}:{}", self.app_id, format_value(self.value))
    }
}

/// Shortest round-trip form with a signed, two-digit exponent (`1e+16`, `2.5e-05`)
fn format_value(value: f64) -> String {
    let debug = format!("{:?}", value);
    match debug.split_once('e') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exponent) => {
                let sign = if exponent < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", mantissa, sign, exponent.abs())
            }
            Err(_) => debug,
        },
        None => debug,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// A supervised module is running or not
    ModuleState { module: String, alive: bool },
    /// A transport lost its link for good or got it back
    Connection { module: String, connected: bool },
    Ignition { on: bool },
    Display { on: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Telemetry(TelemetryEvent),
    Control { source: ControlSource, id: ControlId },
    Most(MostMessage),
    Status(StatusEvent),
}

#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Outbound>,
}

impl Publisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Outbound) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping outbound event: {}", e);
        }
    }

    pub fn telemetry(&self, app_id: &str, value: f64) {
        self.publish(Outbound::Telemetry(TelemetryEvent::new(app_id, value)));
    }

    pub fn control(&self, source: ControlSource, id: ControlId) {
        self.publish(Outbound::Control { source, id });
    }

    pub fn status(&self, status: StatusEvent) {
        self.publish(Outbound::Status(status));
    }
}
