//! Steering-wheel control mapping
//!
//! Maps raw control payloads to a closed set of semantic identifiers. Both the CAN
//! control frames and the LIN steering-wheel-module frames resolve through a
//! [`ControlMapping`]; several payloads may resolve to the same identifier.

use crate::config::{parse_hex_bytes, PayloadSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Which sub-machine of the input state machine consumes an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Button,
    Joystick,
}

/// Semantic button and joystick identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ControlId {
    #[serde(rename = "BTN_ENTER")]
    Enter,
    #[serde(rename = "BTN_BACK")]
    Back,
    #[serde(rename = "BTN_NEXT")]
    Next,
    #[serde(rename = "BTN_PREV")]
    Prev,
    #[serde(rename = "BTN_VOL_UP")]
    VolumeUp,
    #[serde(rename = "BTN_VOL_DOWN")]
    VolumeDown,
    #[serde(rename = "BTN_UP")]
    Up,
    #[serde(rename = "BTN_DOWN")]
    Down,
    #[serde(rename = "BTN_LEFT")]
    Left,
    #[serde(rename = "BTN_RIGHT")]
    Right,
}

impl ControlId {
    pub const ALL: [ControlId; 10] = [
        ControlId::Enter,
        ControlId::Back,
        ControlId::Next,
        ControlId::Prev,
        ControlId::VolumeUp,
        ControlId::VolumeDown,
        ControlId::Up,
        ControlId::Down,
        ControlId::Left,
        ControlId::Right,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlId::Enter => "BTN_ENTER",
            ControlId::Back => "BTN_BACK",
            ControlId::Next => "BTN_NEXT",
            ControlId::Prev => "BTN_PREV",
            ControlId::VolumeUp => "BTN_VOL_UP",
            ControlId::VolumeDown => "BTN_VOL_DOWN",
            ControlId::Up => "BTN_UP",
            ControlId::Down => "BTN_DOWN",
            ControlId::Left => "BTN_LEFT",
            ControlId::Right => "BTN_RIGHT",
        }
    }

    pub fn kind(&self) -> ControlKind {
        match self {
            ControlId::Up | ControlId::Down | ControlId::Left | ControlId::Right => {
                ControlKind::Joystick
            }
            _ => ControlKind::Button,
        }
    }

    /// Unit direction of a joystick identifier, screen coordinates (y grows downwards)
    pub fn direction(&self) -> Option<(i32, i32)> {
        match self {
            ControlId::Up => Some((0, -1)),
            ControlId::Down => Some((0, 1)),
            ControlId::Left => Some((-1, 0)),
            ControlId::Right => Some((1, 0)),
            _ => None,
        }
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown control identifier: {0}")]
pub struct UnknownControl(pub String);

impl FromStr for ControlId {
    type Err = UnknownControl;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControlId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| UnknownControl(s.to_string()))
    }
}

/// Lookup table from raw payload to identifier
#[derive(Debug, Clone, Default)]
pub struct ControlMapping {
    lookup: HashMap<Vec<u8>, ControlId>,
}

impl ControlMapping {
    /// Builds the table from button and joystick sections. Entries with an unknown name or
    /// a malformed payload are logged and skipped.
    pub fn from_tables(
        buttons: &BTreeMap<String, PayloadSpec>,
        joysticks: &BTreeMap<String, PayloadSpec>,
    ) -> Self {
        let mut mapping = Self::default();

        for (name, spec) in buttons.iter().chain(joysticks.iter()) {
            let id = match name.parse::<ControlId>() {
                Ok(id) => id,
                Err(e) => {
                    warn!("Skipping control entry: {}", e);
                    continue;
                }
            };

            for payload in spec.payloads() {
                match parse_hex_bytes(payload) {
                    Some(bytes) if !bytes.is_empty() => mapping.insert(bytes, id),
                    _ => warn!("Skipping malformed payload {:?} for {}", payload, id),
                }
            }
        }

        debug!("Control mapping built with {} payloads", mapping.len());
        mapping
    }

    pub fn insert(&mut self, payload: Vec<u8>, id: ControlId) {
        if let Some(previous) = self.lookup.insert(payload.clone(), id) {
            if previous != id {
                warn!(
                    "Payload {} remapped from {} to {}",
                    hex_string(&payload),
                    previous,
                    id
                );
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<ControlId> {
        self.lookup.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// Space separated upper-case hex, used in log lines
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(lists: &[&[&str]]) -> PayloadSpec {
        PayloadSpec::Multiple(
            lists
                .iter()
                .map(|list| list.iter().map(|s| s.to_string()).collect())
                .collect(),
        )
    }

    #[test]
    fn several_payloads_resolve_to_one_identifier() {
        let mut buttons = BTreeMap::new();
        buttons.insert("BTN_ENTER".to_string(), spec(&[&["0x01", "0x00"], &["0x01", "0x80"]]));
        let mut joysticks = BTreeMap::new();
        joysticks.insert(
            "BTN_UP".to_string(),
            PayloadSpec::Single(vec!["0x10".into(), "0x00".into()]),
        );

        let mapping = ControlMapping::from_tables(&buttons, &joysticks);
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping.lookup(&[0x01, 0x00]), Some(ControlId::Enter));
        assert_eq!(mapping.lookup(&[0x01, 0x80]), Some(ControlId::Enter));
        assert_eq!(mapping.lookup(&[0x10, 0x00]), Some(ControlId::Up));
        assert_eq!(mapping.lookup(&[0x99, 0x00]), None);
    }

    #[test]
    fn unknown_names_and_bad_bytes_are_skipped() {
        let mut buttons = BTreeMap::new();
        buttons.insert("BTN_EJECT".to_string(), spec(&[&["0x01"]]));
        buttons.insert("BTN_BACK".to_string(), spec(&[&["0xZZ"], &["0x02"]]));

        let mapping = ControlMapping::from_tables(&buttons, &BTreeMap::new());
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.lookup(&[0x02]), Some(ControlId::Back));
    }

    #[test]
    fn identifiers_round_trip_through_names() {
        for id in ControlId::ALL {
            assert_eq!(id.as_str().parse::<ControlId>(), Ok(id));
        }
        assert_eq!(ControlId::Up.kind(), ControlKind::Joystick);
        assert_eq!(ControlId::Enter.kind(), ControlKind::Button);
        assert_eq!(ControlId::Left.direction(), Some((-1, 0)));
        assert_eq!(ControlId::Next.direction(), None);
    }

    #[test]
    fn formats_hex_for_logs() {
        assert_eq!(hex_string(&[0x0A, 0xFF, 0x00]), "0A FF 00");
    }
}
