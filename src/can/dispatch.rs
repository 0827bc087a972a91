//! Inbound frame dispatch
//!
//! Sensor replies are matched by reply id, then told apart by the two parameter bytes.
//! Frames on the control reply id are turned into [`ControlSignal`]s for the input machine.

use crate::can::bus::RawFrame;
use crate::catalog::{FormulaError, SensorDefinition};
use crate::config::{parse_hex_bytes, parse_hex_u32, CanControlSettings};
use crate::control::{hex_string, ControlId, ControlMapping};
use crate::input::ControlSignal;
use crate::publish::{ControlSource, Publisher};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const ACTION_OFFSET: usize = 2;
const PARAMETER_OFFSET: usize = 3;
const VALUE_OFFSET: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Frame 0x{id:X} too short for {sensor}: {len} bytes")]
    ShortFrame { id: u32, sensor: String, len: usize },

    #[error("Scale formula failed for {sensor}: {source}")]
    Scale {
        sensor: String,
        #[source]
        source: FormulaError,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid control block: {0}")]
pub struct ControlConfigError(String);

/// Result of looking at one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Telemetry { app_id: String, value: f64 },
    Control(ControlId),
    /// Control frame carrying the idle pattern
    ControlIdle,
    /// Control frame with a payload the mapping does not know
    ControlUnknown(Vec<u8>),
    /// No sensor template matched
    NoMatch,
}

/// Control frame decoding for one interface
#[derive(Debug, Clone)]
pub struct ControlDecoder {
    pub reply_id: u32,
    zero_message: Vec<u8>,
    byte_count: usize,
    mapping: ControlMapping,
}

impl ControlDecoder {
    pub fn from_settings(settings: &CanControlSettings) -> Result<Self, ControlConfigError> {
        let reply_id = parse_hex_u32(&settings.rep_id)
            .ok_or_else(|| ControlConfigError(format!("rep_id {:?}", settings.rep_id)))?;
        let zero_message = parse_hex_bytes(&settings.zero_message).ok_or_else(|| {
            ControlConfigError(format!("zero_message {:?}", settings.zero_message))
        })?;
        if settings.control_byte_count == 0 || settings.control_byte_count > 8 {
            return Err(ControlConfigError(format!(
                "control_byte_count {}",
                settings.control_byte_count
            )));
        }

        Ok(Self {
            reply_id,
            zero_message,
            byte_count: settings.control_byte_count,
            mapping: ControlMapping::from_tables(&settings.button, &settings.joystick),
        })
    }

    pub fn decode(&self, data: &[u8]) -> Decoded {
        if !self.zero_message.is_empty() && data.ends_with(&self.zero_message) {
            return Decoded::ControlIdle;
        }
        let start = data.len().saturating_sub(self.byte_count);
        let key = &data[start..];
        match self.mapping.lookup(key) {
            Some(id) => Decoded::Control(id),
            None => Decoded::ControlUnknown(key.to_vec()),
        }
    }
}

pub struct CanDispatcher {
    channel: String,
    sensors: BTreeMap<u32, Vec<SensorDefinition>>,
    control: Option<ControlDecoder>,
    publisher: Publisher,
    control_tx: mpsc::Sender<ControlSignal>,
}

impl CanDispatcher {
    pub fn new(
        channel: &str,
        sensors: BTreeMap<u32, Vec<SensorDefinition>>,
        control: Option<ControlDecoder>,
        publisher: Publisher,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Self {
        Self {
            channel: channel.to_string(),
            sensors,
            control,
            publisher,
            control_tx,
        }
    }

    /// Decodes without side effects. At most one sensor is decoded per frame; a frame no
    /// sensor claims is still offered to the control decoder.
    pub fn decode(&self, frame: &RawFrame) -> Result<Decoded, DecodeError> {
        if let Some(candidates) = self.sensors.get(&frame.id) {
            if let Some(telemetry) = decode_sensor(frame, candidates)? {
                return Ok(telemetry);
            }
        }

        match &self.control {
            Some(control) if control.reply_id == frame.id => Ok(control.decode(&frame.data)),
            _ => Ok(Decoded::NoMatch),
        }
    }

    /// Decodes and forwards. Never fails: problems are logged and the frame dropped.
    pub fn dispatch(&self, frame: &RawFrame) {
        let decoded = match self.decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("{}: {}", self.channel, e);
                return;
            }
        };

        match decoded {
            Decoded::Telemetry { app_id, value } => {
                debug!("{}: {} = {}", self.channel, app_id, value);
                self.publisher.telemetry(&app_id, value);
            }
            Decoded::Control(id) => {
                self.publisher.control(ControlSource::Can, id);
                self.forward(ControlSignal::Decoded {
                    source: ControlSource::Can,
                    id,
                });
            }
            Decoded::ControlIdle => self.forward(ControlSignal::Idle {
                source: ControlSource::Can,
            }),
            Decoded::ControlUnknown(key) => {
                debug!("{}: unrecognized control payload [{}]", self.channel, hex_string(&key));
                self.forward(ControlSignal::Idle {
                    source: ControlSource::Can,
                });
            }
            Decoded::NoMatch => {}
        }
    }

    fn forward(&self, signal: ControlSignal) {
        if let Err(e) = self.control_tx.try_send(signal) {
            debug!("Control signal dropped: {}", e);
        }
    }
}

/// Selects the sensor by its parameter bytes, then reads and scales its value
fn decode_sensor(
    frame: &RawFrame,
    candidates: &[SensorDefinition],
) -> Result<Option<Decoded>, DecodeError> {
    let data = &frame.data;
    if data.len() < VALUE_OFFSET {
        return Ok(None);
    }

    // The request shares the id on some gateways; it carries the request action
    let Some(sensor) = candidates.iter().find(|sensor| {
        data[ACTION_OFFSET] != sensor.action
            && data[PARAMETER_OFFSET..VALUE_OFFSET] == sensor.parameter
    }) else {
        return Ok(None);
    };

    let width = if sensor.is_16bit { 2 } else { 1 };
    if data.len() < VALUE_OFFSET + width {
        return Err(DecodeError::ShortFrame {
            id: frame.id,
            sensor: sensor.name.clone(),
            len: data.len(),
        });
    }

    let raw = if sensor.is_16bit {
        u16::from_be_bytes([data[VALUE_OFFSET], data[VALUE_OFFSET + 1]]) as f64
    } else {
        data[VALUE_OFFSET] as f64
    };
    let value = sensor.scale.apply(raw).map_err(|source| DecodeError::Scale {
        sensor: sensor.name.clone(),
        source,
    })?;
    Ok(Some(Decoded::Telemetry {
        app_id: sensor.app_id.clone(),
        value,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ScaleFormula, SensorRole};
    use crate::config::PayloadSpec;
    use crate::publish::Outbound;
    use std::time::Duration;

    fn sensor(name: &str, parameter: [u8; 2], is_16bit: bool, scale: &str) -> SensorDefinition {
        SensorDefinition {
            name: name.to_string(),
            interface: "can0".to_string(),
            request_id: 0x6F1,
            reply_id: 0x612,
            target: 0x12,
            action: 0x22,
            parameter,
            data_length: 0xCC,
            is_16bit,
            scale: ScaleFormula::parse(scale).unwrap(),
            refresh: Duration::from_millis(500),
            role: SensorRole::Diagnostic,
            app_id: name.to_string(),
        }
    }

    fn dispatcher(
        sensors: Vec<SensorDefinition>,
        control: Option<ControlDecoder>,
    ) -> (CanDispatcher, mpsc::Receiver<Outbound>, mpsc::Receiver<ControlSignal>) {
        let mut by_reply: BTreeMap<u32, Vec<SensorDefinition>> = BTreeMap::new();
        for s in sensors {
            by_reply.entry(s.reply_id).or_default().push(s);
        }
        let (publisher, out_rx) = Publisher::new(16);
        let (control_tx, control_rx) = mpsc::channel(16);
        let dispatcher = CanDispatcher::new("can0", by_reply, control, publisher, control_tx);
        (dispatcher, out_rx, control_rx)
    }

    fn control_decoder() -> ControlDecoder {
        let mut button = BTreeMap::new();
        button.insert(
            "BTN_ENTER".to_string(),
            PayloadSpec::Single(vec!["0x01".into(), "0x20".into()]),
        );
        let mut joystick = BTreeMap::new();
        joystick.insert(
            "BTN_UP".to_string(),
            PayloadSpec::Single(vec!["0x00".into(), "0x81".into()]),
        );
        ControlDecoder::from_settings(&CanControlSettings {
            enabled: true,
            interface: "can0".to_string(),
            rep_id: "0x267".to_string(),
            zero_message: vec!["0x00".into(), "0xC0".into()],
            control_byte_count: 2,
            button,
            joystick,
            timing: Default::default(),
        })
        .unwrap()
    }

    fn reply(p0: u8, p1: u8, hi: u8, lo: u8) -> RawFrame {
        RawFrame::new(0x612, false, &[0xF1, 0x05, 0x62, p0, p1, hi, lo, 0xFF])
    }

    #[test]
    fn parameter_bytes_select_exactly_one_sensor() {
        let (d, _, _) = dispatcher(
            vec![
                sensor("boost", [0x10, 0x00], true, "value"),
                sensor("coolant", [0x10, 0x01], false, "value - 48"),
            ],
            None,
        );

        assert_eq!(
            d.decode(&reply(0x10, 0x01, 0x78, 0x00)).unwrap(),
            Decoded::Telemetry {
                app_id: "coolant".to_string(),
                value: 72.0
            }
        );
        assert_eq!(
            d.decode(&reply(0x10, 0x00, 0x01, 0x02)).unwrap(),
            Decoded::Telemetry {
                app_id: "boost".to_string(),
                value: 258.0
            }
        );
        assert_eq!(d.decode(&reply(0x10, 0x07, 0x01, 0x02)).unwrap(), Decoded::NoMatch);
    }

    #[test]
    fn eight_bit_value_uses_the_first_byte_only() {
        let (d, _, _) = dispatcher(vec![sensor("gear", [0x10, 0x00], false, "value")], None);
        assert_eq!(
            d.decode(&reply(0x10, 0x00, 0x01, 0x02)).unwrap(),
            Decoded::Telemetry {
                app_id: "gear".to_string(),
                value: 1.0
            }
        );
    }

    #[test]
    fn scale_formula_is_applied() {
        let (d, mut out, _) = dispatcher(vec![sensor("speed", [0x10, 0x00], true, "value * 0.1")], None);
        d.dispatch(&reply(0x10, 0x00, 0x00, 0xFA));

        match out.try_recv() {
            Ok(Outbound::Telemetry(t)) => {
                assert_eq!(t.app_id, "speed");
                assert!((t.value - 25.0).abs() < 1e-9);
                assert_eq!(t.payload(), "speed:25.0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_echo_is_not_a_reply() {
        let (d, mut out, _) = dispatcher(vec![sensor("boost", [0x10, 0x00], true, "value")], None);
        let echo = RawFrame::new(0x612, false, &[0xCC, 0x12, 0x22, 0x10, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(d.decode(&echo).unwrap(), Decoded::NoMatch);
        d.dispatch(&echo);
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn short_frames_are_decode_errors() {
        let (d, mut out, _) = dispatcher(vec![sensor("boost", [0x10, 0x00], true, "value")], None);
        let short = RawFrame::new(0x612, false, &[0xF1, 0x05, 0x62, 0x10, 0x00, 0x01]);
        assert!(matches!(d.decode(&short), Err(DecodeError::ShortFrame { len: 6, .. })));
        d.dispatch(&short);
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn short_frame_only_fails_the_selected_sensor() {
        let (d, _, _) = dispatcher(
            vec![
                sensor("wide", [0x10, 0x00], true, "value"),
                sensor("gear", [0x10, 0x01], false, "value"),
            ],
            None,
        );
        let frame = RawFrame::new(0x612, false, &[0xF1, 0x05, 0x62, 0x10, 0x01, 0x03]);
        assert_eq!(
            d.decode(&frame).unwrap(),
            Decoded::Telemetry {
                app_id: "gear".to_string(),
                value: 3.0
            }
        );
    }

    #[test]
    fn control_id_shared_with_a_sensor_still_decodes_controls() {
        let mut control = control_decoder();
        control.reply_id = 0x612;
        let (d, mut out, mut control_rx) =
            dispatcher(vec![sensor("boost", [0x10, 0x00], true, "value")], Some(control));

        let frame = RawFrame::new(0x612, false, &[0xF0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x20]);
        assert_eq!(d.decode(&frame).unwrap(), Decoded::Control(ControlId::Enter));

        d.dispatch(&reply(0x10, 0x00, 0x00, 0x10));
        d.dispatch(&frame);
        assert!(matches!(out.try_recv(), Ok(Outbound::Telemetry(t)) if t.app_id == "boost"));
        assert!(matches!(
            out.try_recv(),
            Ok(Outbound::Control { id: ControlId::Enter, .. })
        ));
        assert_eq!(
            control_rx.try_recv().unwrap(),
            ControlSignal::Decoded {
                source: ControlSource::Can,
                id: ControlId::Enter
            }
        );
    }

    #[test]
    fn control_frames_reach_the_input_machine() {
        let (d, mut out, mut control) = dispatcher(Vec::new(), Some(control_decoder()));

        d.dispatch(&RawFrame::new(0x267, false, &[0xF0, 0x01, 0x20]));
        assert_eq!(
            control.try_recv().unwrap(),
            ControlSignal::Decoded {
                source: ControlSource::Can,
                id: ControlId::Enter
            }
        );
        assert!(matches!(
            out.try_recv(),
            Ok(Outbound::Control { id: ControlId::Enter, .. })
        ));

        // Idle pattern and unknown payloads still tick the timeout
        d.dispatch(&RawFrame::new(0x267, false, &[0xF0, 0x00, 0xC0]));
        d.dispatch(&RawFrame::new(0x267, false, &[0xF0, 0x55, 0x55]));
        assert_eq!(
            control.try_recv().unwrap(),
            ControlSignal::Idle {
                source: ControlSource::Can
            }
        );
        assert_eq!(
            control.try_recv().unwrap(),
            ControlSignal::Idle {
                source: ControlSource::Can
            }
        );
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn control_block_is_validated() {
        let mut settings = CanControlSettings {
            enabled: true,
            interface: "can0".to_string(),
            rep_id: "0x267".to_string(),
            zero_message: Vec::new(),
            control_byte_count: 0,
            button: BTreeMap::new(),
            joystick: BTreeMap::new(),
            timing: Default::default(),
        };
        assert!(ControlDecoder::from_settings(&settings).is_err());
        settings.control_byte_count = 2;
        settings.rep_id = "nope".to_string();
        assert!(ControlDecoder::from_settings(&settings).is_err());
    }
}
