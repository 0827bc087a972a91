//! Input state machine
//!
//! Merges the control identifiers decoded on the CAN and LIN buses into one debounced,
//! long-press-aware stream of synthetic input actions.
//!
//! ```text
//! CAN dispatcher ──┐
//!                  ├──► ControlSignal ──► [Button | Joystick] ──► InputAction ──► InputSink
//! LIN reader ──────┘                           │
//!                                       long press ──► mouse mode / DisplayToggle
//! ```
//!
//! The machine runs as one task. Each loop iteration waits a short time for a signal and
//! always ends with the timeout check, so a held button is released even when the bus
//! goes quiet.

pub mod action;
pub mod button;
pub mod joystick;

pub use action::{ChannelInputSink, InputAction, InputSink, Key};
pub use button::{ButtonEvent, ButtonMachine, ButtonState};
pub use joystick::{JoystickMachine, JoystickState};

use crate::config::InputTiming;
use crate::control::{ControlId, ControlKind};
use crate::publish::ControlSource;
use crate::supervisor::signals::{Signal, SignalSet};
use action::{long_press_action, press_action, LongPressAction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Longest wait for a signal before the timeout check runs anyway
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a bus reader hands to the input machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// A control frame resolved to an identifier
    Decoded { source: ControlSource, id: ControlId },
    /// A control frame without an identifier (idle pattern or unknown payload)
    Idle { source: ControlSource },
}

pub type ControlReceiver = Arc<Mutex<mpsc::Receiver<ControlSignal>>>;

pub fn control_channel(capacity: usize) -> (mpsc::Sender<ControlSignal>, ControlReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(Mutex::new(rx)))
}

pub struct InputStateMachine {
    buttons: ButtonMachine,
    joystick: JoystickMachine,
    mouse_mode: bool,
    signals: Arc<SignalSet>,
    sink: Arc<dyn InputSink>,
}

impl InputStateMachine {
    pub fn new(timing: &InputTiming, signals: Arc<SignalSet>, sink: Arc<dyn InputSink>) -> Self {
        Self {
            buttons: ButtonMachine::new(timing.click_timeout(), timing.long_press_duration()),
            joystick: JoystickMachine::new(timing.click_timeout(), timing.mouse_speed),
            mouse_mode: false,
            signals,
            sink,
        }
    }

    pub fn mouse_mode(&self) -> bool {
        self.mouse_mode
    }

    pub fn button_state(&self) -> ButtonState {
        self.buttons.state()
    }

    pub fn joystick_state(&self) -> JoystickState {
        self.joystick.state()
    }

    /// Feeds one decode tick. `None` means the tick carried no identifier.
    pub fn handle(&mut self, id: Option<ControlId>, now: Instant) {
        match id.map(|id| (id, id.kind())) {
            Some((id, ControlKind::Button)) => {
                for event in self.buttons.observe(id, now) {
                    self.apply(event);
                }
                self.joystick.idle();
            }
            Some((id, ControlKind::Joystick)) => {
                if let Some(action) = self.joystick.observe(id, self.mouse_mode, now) {
                    self.sink.emit(action);
                }
                self.check_timeout(now);
            }
            None => {
                self.joystick.idle();
                self.check_timeout(now);
            }
        }
    }

    pub fn check_timeout(&mut self, now: Instant) {
        if let Some(event) = self.buttons.check_timeout(now) {
            self.apply(event);
        }
    }

    /// Back to idle with mouse mode cleared
    pub fn reset(&mut self) {
        self.buttons.reset();
        self.joystick.reset();
        self.mouse_mode = false;
    }

    fn apply(&mut self, event: ButtonEvent) {
        match event {
            ButtonEvent::Pressed(id) => {
                if let Some(action) = press_action(id, self.mouse_mode) {
                    self.sink.emit(action);
                }
            }
            ButtonEvent::LongPress(id) => match long_press_action(id) {
                Some(LongPressAction::ToggleMouseMode) => {
                    self.mouse_mode = !self.mouse_mode;
                    info!("Mouse mode {}", if self.mouse_mode { "on" } else { "off" });
                }
                Some(LongPressAction::ToggleDisplay) => {
                    info!("Display toggle requested");
                    self.signals.raise(Signal::DisplayToggle);
                }
                None => debug!("No long press action for {}", id),
            },
            ButtonEvent::Released { .. } => {}
        }
    }
}

/// Runs the input machine until the token is cancelled or every sender is gone.
/// Holds the receiver lock for its whole lifetime so only one machine consumes signals.
pub async fn run(
    receiver: ControlReceiver,
    mut machine: InputStateMachine,
    token: CancellationToken,
) {
    let mut rx = receiver.lock().await;
    info!("Input state machine running");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Input state machine stopping");
                break;
            }
            received = tokio::time::timeout(POLL_INTERVAL, rx.recv()) => {
                let now = Instant::now();
                match received {
                    Ok(Some(ControlSignal::Decoded { source, id })) => {
                        debug!("{} from {}", id, source);
                        machine.handle(Some(id), now);
                    }
                    Ok(Some(ControlSignal::Idle { .. })) => machine.handle(None, now),
                    Ok(None) => {
                        info!("All control sources closed");
                        break;
                    }
                    Err(_) => {}
                }
                machine.check_timeout(now);
            }
        }
    }

    machine.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        actions: StdMutex<Vec<InputAction>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<InputAction> {
            std::mem::take(&mut *self.actions.lock().unwrap())
        }
    }

    impl InputSink for RecordingSink {
        fn emit(&self, action: InputAction) {
            self.actions.lock().unwrap().push(action);
        }
    }

    fn machine() -> (InputStateMachine, Arc<RecordingSink>, Arc<SignalSet>) {
        let sink = Arc::new(RecordingSink::default());
        let signals = Arc::new(SignalSet::new());
        let machine = InputStateMachine::new(&InputTiming::default(), signals.clone(), sink.clone());
        (machine, sink, signals)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn long_press_prev_switches_enter_to_pointer_click() {
        let (mut machine, sink, _) = machine();
        let t0 = Instant::now();

        machine.handle(Some(ControlId::Enter), t0);
        assert_eq!(sink.take(), vec![InputAction::KeyClick(Key::Space)]);
        machine.check_timeout(t0 + ms(400));

        let t1 = t0 + ms(500);
        for step in 0..=22 {
            machine.handle(Some(ControlId::Prev), t1 + ms(step * 100));
        }
        assert!(machine.mouse_mode());
        assert_eq!(sink.take(), vec![InputAction::KeyClick(Key::V)]);

        let t2 = t1 + ms(3000);
        machine.handle(None, t2);
        machine.handle(Some(ControlId::Enter), t2 + ms(10));
        assert_eq!(sink.take(), vec![InputAction::PointerClick]);
    }

    #[test]
    fn long_press_enter_raises_display_toggle_once() {
        let (mut machine, _, signals) = machine();
        let t0 = Instant::now();
        for step in 0..=40 {
            machine.handle(Some(ControlId::Enter), t0 + ms(step * 100));
        }
        assert!(signals.take(Signal::DisplayToggle));
        assert!(!signals.take(Signal::DisplayToggle));
    }

    #[test]
    fn joystick_moves_pointer_in_mouse_mode() {
        let (mut machine, sink, _) = machine();
        let t0 = Instant::now();
        for step in 0..=21 {
            machine.handle(Some(ControlId::Prev), t0 + ms(step * 100));
        }
        sink.take();

        let t1 = t0 + ms(3000);
        machine.handle(Some(ControlId::Right), t1);
        machine.handle(Some(ControlId::Right), t1 + ms(10));
        assert_eq!(
            sink.take(),
            vec![
                InputAction::PointerMove { dx: 8, dy: 0 },
                InputAction::PointerMove { dx: 8, dy: 0 }
            ]
        );
    }

    #[test]
    fn idle_ticks_release_the_button() {
        let (mut machine, _, _) = machine();
        let t0 = Instant::now();
        machine.handle(Some(ControlId::Back), t0);
        assert_eq!(machine.button_state(), ButtonState::Pressed);

        machine.handle(None, t0 + ms(100));
        assert_eq!(machine.button_state(), ButtonState::Pressed);
        machine.handle(None, t0 + ms(400));
        assert_eq!(machine.button_state(), ButtonState::Idle);
    }

    #[tokio::test]
    async fn task_releases_on_bus_silence_and_stops_on_cancel() {
        let (machine, sink, _) = machine();
        let (tx, rx) = control_channel(8);
        let token = CancellationToken::new();
        let task = tokio::spawn(run(rx.clone(), machine, token.clone()));

        tx.send(ControlSignal::Decoded {
            source: ControlSource::Can,
            id: ControlId::Next,
        })
        .await
        .unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(sink.take(), vec![InputAction::KeyClick(Key::N)]);

        // Silence longer than the click timeout, then the same button is a new press
        tokio::time::sleep(ms(450)).await;
        tx.send(ControlSignal::Decoded {
            source: ControlSource::Lin,
            id: ControlId::Next,
        })
        .await
        .unwrap();
        tokio::time::sleep(ms(100)).await;
        assert_eq!(sink.take(), vec![InputAction::KeyClick(Key::N)]);

        token.cancel();
        tokio::time::timeout(ms(500), task).await.unwrap().unwrap();
        assert!(rx.try_lock().is_ok());
    }
}
