use crate::control::ControlId;
use crate::input::action::{joystick_key, InputAction};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickState {
    Idle,
    Moving(ControlId),
}

/// Joystick sub-machine. Mouse mode moves the pointer on every tick, keyboard mode emits
/// at most one key per click timeout.
#[derive(Debug)]
pub struct JoystickMachine {
    click_timeout: Duration,
    mouse_speed: i32,
    state: JoystickState,
    last_key_at: Option<Instant>,
}

impl JoystickMachine {
    pub fn new(click_timeout: Duration, mouse_speed: i32) -> Self {
        Self {
            click_timeout,
            mouse_speed,
            state: JoystickState::Idle,
            last_key_at: None,
        }
    }

    pub fn state(&self) -> JoystickState {
        self.state
    }

    pub fn observe(&mut self, id: ControlId, mouse_mode: bool, now: Instant) -> Option<InputAction> {
        let (dx, dy) = id.direction()?;
        self.state = JoystickState::Moving(id);

        if mouse_mode {
            return Some(InputAction::PointerMove {
                dx: dx * self.mouse_speed,
                dy: dy * self.mouse_speed,
            });
        }

        if let Some(last) = self.last_key_at {
            if now.saturating_duration_since(last) < self.click_timeout {
                return None;
            }
        }
        self.last_key_at = Some(now);
        joystick_key(id).map(InputAction::KeyClick)
    }

    /// No direction this tick. The key rate limit is kept.
    pub fn idle(&mut self) {
        self.state = JoystickState::Idle;
    }

    pub fn reset(&mut self) {
        self.state = JoystickState::Idle;
        self.last_key_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::action::Key;

    const CLICK: Duration = Duration::from_millis(300);

    #[test]
    fn mouse_mode_moves_every_tick() {
        let mut machine = JoystickMachine::new(CLICK, 8);
        let t0 = Instant::now();

        for step in 0..5 {
            let action = machine.observe(ControlId::Up, true, t0 + Duration::from_millis(step * 10));
            assert_eq!(action, Some(InputAction::PointerMove { dx: 0, dy: -8 }));
        }
        assert_eq!(machine.state(), JoystickState::Moving(ControlId::Up));
    }

    #[test]
    fn keyboard_mode_is_rate_limited() {
        let mut machine = JoystickMachine::new(CLICK, 8);
        let t0 = Instant::now();

        let emitted = (0..10)
            .filter_map(|step| {
                machine.observe(ControlId::Up, false, t0 + Duration::from_millis(step * 25))
            })
            .collect::<Vec<_>>();
        assert_eq!(emitted, vec![InputAction::KeyClick(Key::Up)]);

        let later = machine.observe(ControlId::Down, false, t0 + Duration::from_millis(400));
        assert_eq!(later, Some(InputAction::KeyClick(Key::H)));
    }

    #[test]
    fn absence_goes_idle_without_output() {
        let mut machine = JoystickMachine::new(CLICK, 8);
        let t0 = Instant::now();
        machine.observe(ControlId::Left, false, t0);
        machine.idle();
        assert_eq!(machine.state(), JoystickState::Idle);

        // Rate limit survives the idle tick
        assert_eq!(
            machine.observe(ControlId::Left, false, t0 + Duration::from_millis(100)),
            None
        );
    }

    #[test]
    fn buttons_are_not_directions() {
        let mut machine = JoystickMachine::new(CLICK, 8);
        assert_eq!(machine.observe(ControlId::Enter, true, Instant::now()), None);
        assert_eq!(machine.state(), JoystickState::Idle);
    }
}
