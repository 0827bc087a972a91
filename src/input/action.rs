//! Synthetic input actions and the tables that pick them
//!
//! Lookups are keyed by [`ControlId`], never by name.

use crate::control::ControlId;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Space,
    Backspace,
    N,
    V,
    H,
    Up,
    Left,
    Right,
}

/// What the OS input device is asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    /// Press and release of one key
    KeyClick(Key),
    /// Left pointer button press and release
    PointerClick,
    /// Relative pointer motion
    PointerMove { dx: i32, dy: i32 },
}

/// Action of a button press. Enter depends on the mode.
pub fn press_action(id: ControlId, mouse_mode: bool) -> Option<InputAction> {
    match id {
        ControlId::Enter if mouse_mode => Some(InputAction::PointerClick),
        ControlId::Enter => Some(InputAction::KeyClick(Key::Space)),
        ControlId::Back => Some(InputAction::KeyClick(Key::Backspace)),
        ControlId::Next => Some(InputAction::KeyClick(Key::N)),
        ControlId::Prev => Some(InputAction::KeyClick(Key::V)),
        _ => None,
    }
}

/// Key emitted for a joystick direction outside mouse mode
pub fn joystick_key(id: ControlId) -> Option<Key> {
    match id {
        ControlId::Up => Some(Key::Up),
        ControlId::Down => Some(Key::H),
        ControlId::Left => Some(Key::Left),
        ControlId::Right => Some(Key::Right),
        _ => None,
    }
}

/// Long-press behaviour of a button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPressAction {
    ToggleMouseMode,
    ToggleDisplay,
}

pub fn long_press_action(id: ControlId) -> Option<LongPressAction> {
    match id {
        ControlId::Enter => Some(LongPressAction::ToggleDisplay),
        ControlId::Prev => Some(LongPressAction::ToggleMouseMode),
        _ => None,
    }
}

/// Receives synthetic input actions. Concurrent use from several workers is allowed.
pub trait InputSink: Send + Sync {
    fn emit(&self, action: InputAction);
}

/// Forwards actions to whatever drives the OS input device
#[derive(Debug, Clone)]
pub struct ChannelInputSink {
    tx: mpsc::Sender<InputAction>,
}

impl ChannelInputSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<InputAction>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl InputSink for ChannelInputSink {
    fn emit(&self, action: InputAction) {
        if let Err(e) = self.tx.try_send(action) {
            warn!("Dropping input action: {}", e);
        }
    }
}
