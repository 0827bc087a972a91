//! Edge-triggered signals shared by workers, the MQTT bridge and the supervisor
//!
//! Each [`Signal`] is an independent atomic flag. Anyone may raise a flag; the observer
//! that acts on it clears it in the same atomic swap, so one raise triggers exactly one
//! reaction.

use std::sync::atomic::{AtomicBool, Ordering};

const SIGNAL_COUNT: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    ToggleCan,
    ToggleLin,
    ToggleMost,
    ToggleInput,
    ToggleIgnition,
    /// Stop every bus module and start them again
    Restart,
    /// Stop everything and leave the process
    Exit,
    /// Display/RTI toggle, consumed outside the bus core
    DisplayToggle,
    /// Publish the ignition state on next observation
    IgnitionQuery,
    /// Send the force-switch command to the ring-bus device
    MostForceSwitch,
    /// Publish the state of every module
    StatusQuery,
}

impl Signal {
    pub const ALL: [Signal; SIGNAL_COUNT] = [
        Signal::ToggleCan,
        Signal::ToggleLin,
        Signal::ToggleMost,
        Signal::ToggleInput,
        Signal::ToggleIgnition,
        Signal::Restart,
        Signal::Exit,
        Signal::DisplayToggle,
        Signal::IgnitionQuery,
        Signal::MostForceSwitch,
        Signal::StatusQuery,
    ];

    fn index(self) -> usize {
        match self {
            Signal::ToggleCan => 0,
            Signal::ToggleLin => 1,
            Signal::ToggleMost => 2,
            Signal::ToggleInput => 3,
            Signal::ToggleIgnition => 4,
            Signal::Restart => 5,
            Signal::Exit => 6,
            Signal::DisplayToggle => 7,
            Signal::IgnitionQuery => 8,
            Signal::MostForceSwitch => 9,
            Signal::StatusQuery => 10,
        }
    }
}

#[derive(Debug, Default)]
pub struct SignalSet {
    flags: [AtomicBool; SIGNAL_COUNT],
}

impl SignalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, signal: Signal) {
        self.flags[signal.index()].store(true, Ordering::SeqCst);
    }

    /// Returns whether the signal was set and clears it
    pub fn take(&self, signal: Signal) -> bool {
        self.flags[signal.index()].swap(false, Ordering::SeqCst)
    }

    /// Looks without clearing
    pub fn is_raised(&self, signal: Signal) -> bool {
        self.flags[signal.index()].load(Ordering::SeqCst)
    }

    pub fn clear(&self, signal: Signal) {
        self.flags[signal.index()].store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn take_is_edge_triggered() {
        let signals = SignalSet::new();
        assert!(!signals.take(Signal::ToggleCan));

        signals.raise(Signal::ToggleCan);
        signals.raise(Signal::ToggleCan);
        assert!(signals.is_raised(Signal::ToggleCan));
        assert!(signals.take(Signal::ToggleCan));
        assert!(!signals.take(Signal::ToggleCan));
    }

    #[test]
    fn signals_are_independent() {
        let signals = SignalSet::new();
        signals.raise(Signal::Exit);
        assert!(!signals.is_raised(Signal::Restart));
        signals.clear(Signal::Exit);
        assert!(!signals.take(Signal::Exit));
    }

    #[test]
    fn one_raise_is_observed_once_across_threads() {
        let signals = Arc::new(SignalSet::new());
        signals.raise(Signal::DisplayToggle);

        let observers: Vec<_> = (0..8)
            .map(|_| {
                let signals = signals.clone();
                std::thread::spawn(move || signals.take(Signal::DisplayToggle))
            })
            .collect();

        let observed = observers
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|taken| *taken)
            .count();
        assert_eq!(observed, 1);
    }
}
