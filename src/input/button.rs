//! Button sub-machine: press sessions, long-press and the release timeout
//!
//! All methods take the current instant so the machine never reads the clock itself.

use crate::control::ControlId;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Idle,
    Pressed,
    LongPressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Pressed(ControlId),
    Released { id: ControlId, held: Duration },
    LongPress(ControlId),
}

/// The one press that is currently in progress
#[derive(Debug, Clone, Copy)]
struct PressSession {
    id: ControlId,
    started: Instant,
    last_seen: Instant,
    long_press_fired: bool,
}

#[derive(Debug)]
pub struct ButtonMachine {
    click_timeout: Duration,
    long_press: Duration,
    session: Option<PressSession>,
}

impl ButtonMachine {
    pub fn new(click_timeout: Duration, long_press: Duration) -> Self {
        Self {
            click_timeout,
            long_press,
            session: None,
        }
    }

    pub fn state(&self) -> ButtonState {
        match self.session {
            None => ButtonState::Idle,
            Some(s) if s.long_press_fired => ButtonState::LongPressed,
            Some(_) => ButtonState::Pressed,
        }
    }

    pub fn pressed(&self) -> Option<ControlId> {
        self.session.map(|s| s.id)
    }

    /// Handles one tick that carried `id`
    pub fn observe(&mut self, id: ControlId, now: Instant) -> Vec<ButtonEvent> {
        let mut events = Vec::new();

        if self.pressed() != Some(id) {
            if let Some(released) = self.release(now) {
                events.push(released);
            }
            debug!("Button pressed: {}", id);
            self.session = Some(PressSession {
                id,
                started: now,
                last_seen: now,
                long_press_fired: false,
            });
            events.push(ButtonEvent::Pressed(id));
        }

        if let Some(session) = self.session.as_mut() {
            session.last_seen = now;
            if !session.long_press_fired
                && now.saturating_duration_since(session.started) > self.long_press
            {
                session.long_press_fired = true;
                debug!("Long press on {}", id);
                events.push(ButtonEvent::LongPress(id));
            }
        }

        events
    }

    /// Releases the held button once nothing was seen for longer than the click timeout.
    /// Must run on every receive iteration, decoded frame or not.
    pub fn check_timeout(&mut self, now: Instant) -> Option<ButtonEvent> {
        let session = self.session?;
        if now.saturating_duration_since(session.last_seen) > self.click_timeout {
            self.release(now)
        } else {
            None
        }
    }

    fn release(&mut self, now: Instant) -> Option<ButtonEvent> {
        let session = self.session.take()?;
        let held = now.saturating_duration_since(session.started);
        if session.long_press_fired {
            debug!("{} released after long press ({:?})", session.id, held);
        } else {
            debug!("{} released after {:?}", session.id, held);
        }
        Some(ButtonEvent::Released {
            id: session.id,
            held,
        })
    }

    pub fn reset(&mut self) {
        self.session = None;
    }
}
